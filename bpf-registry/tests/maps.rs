use std::net::Ipv4Addr;

use assert_matches::assert_matches;
use bpf_registry::{
    maps::{
        lpm_trie::Key, Array, CpuPolicy, HashMap, LpmTrie, MapDescriptor, PerCpuArray,
        PerCpuHashMap, PerCpuValues, Queue, Reduced, Reduction, UpdatePolicy,
    },
    sys::MemoryDriver,
    MapError, MapRegistry,
};

fn registry() -> MapRegistry {
    MapRegistry::new(MemoryDriver::new(4))
}

#[test_log::test]
fn array_lookup_range() {
    let registry = registry();
    for max_entries in [1, 7, 64] {
        let map = registry
            .create(MapDescriptor::array::<u64>(format!("array_{max_entries}"), max_entries))
            .unwrap();
        let array = Array::<_, u64>::try_from(map).unwrap();
        for index in 0..max_entries {
            assert_eq!(array.lookup(index).unwrap(), 0);
        }
        for index in [max_entries, max_entries + 1, u32::MAX] {
            assert_matches!(
                array.lookup(index),
                Err(MapError::OutOfRange { index: i, max_entries: m })
                    if i == index && m == max_entries
            );
        }
    }
}

#[test_log::test]
fn lru_evicts_least_recently_used() {
    const N: u32 = 8;
    let registry = registry();
    let map = registry
        .create(MapDescriptor::lru_hash::<u32, u32>("lru", N))
        .unwrap();
    let mut hm = HashMap::<_, u32, u32>::try_from(map).unwrap();

    for key in 0..N {
        hm.update(key, key * 10, UpdatePolicy::Any).unwrap();
    }
    // key 0 becomes the most recently used
    assert_eq!(hm.lookup(&0).unwrap(), Some(0));
    hm.update(N, N * 10, UpdatePolicy::Any).unwrap();

    let missing = (0..=N)
        .filter(|key| hm.lookup(key).unwrap().is_none())
        .collect::<Vec<_>>();
    assert_eq!(missing, [1]);
    assert_eq!(hm.keys().count(), N as usize);
}

#[test_log::test]
fn lpm_trie_longest_match() {
    let registry = registry();
    let map = registry
        .create(MapDescriptor::lpm_trie::<u32, u32>("lpm", 255))
        .unwrap();
    let mut trie = LpmTrie::<_, u32, u32>::try_from(map).unwrap();

    trie.update(&Key::new(8, 0x0A00_0000u32.to_be()), 8, UpdatePolicy::Any)
        .unwrap();
    trie.update(&Key::new(24, 0x0A00_0100u32.to_be()), 24, UpdatePolicy::Any)
        .unwrap();

    let lookup = |addr: Ipv4Addr| trie.lookup(&Key::new(32, u32::from(addr).to_be()));
    assert_eq!(lookup(Ipv4Addr::new(10, 0, 1, 1)).unwrap(), Some(24));
    assert_eq!(lookup(Ipv4Addr::new(10, 0, 2, 1)).unwrap(), Some(8));
    assert_eq!(lookup(Ipv4Addr::new(11, 0, 0, 0)).unwrap(), None);

    // a shorter lookup prefix can't match the longer entry
    assert_eq!(
        trie.lookup(&Key::new(16, 0x0A00_0101u32.to_be())).unwrap(),
        Some(8)
    );
}

#[test_log::test]
fn queue_fifo_with_capacity() {
    let registry = registry();
    let map = registry
        .create(MapDescriptor::queue::<u32>("queue", 2))
        .unwrap();
    let mut queue = Queue::<_, u32>::try_from(map).unwrap();

    queue.push(1).unwrap();
    queue.push(2).unwrap();
    assert_matches!(queue.push(3), Err(MapError::CapacityExceeded { .. }));
    assert_eq!(queue.pop().unwrap(), Some(1));
    assert_eq!(queue.pop().unwrap(), Some(2));
    assert_eq!(queue.pop().unwrap(), None);
}

#[test_log::test]
fn read_your_writes() {
    let registry = registry();
    let hash = registry
        .create(MapDescriptor::hash::<u64, [u8; 16]>("hash", 32))
        .unwrap();
    let array = registry
        .create(MapDescriptor::array::<[u8; 16]>("array", 32))
        .unwrap();
    let mut hm = HashMap::<_, u64, [u8; 16]>::try_from(hash).unwrap();
    let mut array = Array::<_, [u8; 16]>::try_from(array).unwrap();

    for i in 0..32u32 {
        let value = [i as u8; 16];
        hm.update(u64::from(i) << 32, value, UpdatePolicy::Any)
            .unwrap();
        assert_eq!(hm.lookup(&(u64::from(i) << 32)).unwrap(), Some(value));

        array.update(i, value, UpdatePolicy::Any).unwrap();
        assert_eq!(array.lookup(i).unwrap(), value);
    }
}

#[test_log::test]
fn per_cpu_current_cpu_writes_one_slot() {
    let driver = MemoryDriver::new(4);
    driver.set_current_cpu(Some(2));
    let registry = MapRegistry::new(driver);
    let map = registry
        .create(MapDescriptor::per_cpu_hash::<u32, u64>("per_cpu", 4))
        .unwrap();
    let mut hm = PerCpuHashMap::<_, u32, u64>::try_from(map).unwrap();

    hm.update(7, 5, CpuPolicy::CurrentCpu, UpdatePolicy::Any)
        .unwrap();
    assert_eq!(
        hm.lookup(&7).unwrap(),
        Some(PerCpuValues::from(vec![0, 0, 5, 0]))
    );
    hm.update(7, 1, CpuPolicy::Cpu(0), UpdatePolicy::Exist)
        .unwrap();
    assert_eq!(hm.lookup_cpu(&7, 0).unwrap(), Some(1));
    assert_eq!(
        hm.lookup_reduced(&7, Reduction::Sum).unwrap(),
        Some(Reduced::Sum(6))
    );
    assert_matches!(
        hm.update(7, 1, CpuPolicy::Cpu(4), UpdatePolicy::Any),
        Err(MapError::CpuOutOfRange { cpu: 4, nr_cpus: 4 })
    );
}

#[test_log::test]
fn per_cpu_sum_wraps() {
    let registry = MapRegistry::new(MemoryDriver::new(2));
    let map = registry
        .create(MapDescriptor::per_cpu_array::<u8>("counters", 1))
        .unwrap();
    let mut array = PerCpuArray::<_, u8>::try_from(map).unwrap();

    array
        .update_values(0, PerCpuValues::from(vec![200, 100]), UpdatePolicy::Any)
        .unwrap();
    assert_eq!(
        array.lookup_reduced(0, Reduction::Sum).unwrap(),
        Reduced::Sum(44)
    );
    assert_matches!(
        array.update_values(0, PerCpuValues::from(vec![1, 2, 3]), UpdatePolicy::Any),
        Err(MapError::LayoutMismatch { .. })
    );
}

#[cfg(target_os = "linux")]
#[test_log::test]
#[ignore = "requires CAP_BPF"]
fn syscall_driver_hash_map() {
    use bpf_registry::sys::SyscallDriver;

    let registry = MapRegistry::new(SyscallDriver::new());
    let map = registry
        .create(MapDescriptor::hash::<u32, u32>("registry_test", 4))
        .unwrap();
    let mut hm = HashMap::<_, u32, u32>::try_from(map).unwrap();

    hm.update(1, 42, UpdatePolicy::NoExist).unwrap();
    assert_eq!(hm.lookup(&1).unwrap(), Some(42));
    assert!(hm.delete(&1).unwrap());
    assert!(!hm.delete(&1).unwrap());

    drop(hm);
    assert!(registry.remove("registry_test").unwrap());
}
