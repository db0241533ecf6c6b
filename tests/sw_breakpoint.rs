//! S2: installing a software breakpoint patches the target's memory with a
//! trap instruction; removing it restores the original bytes byte-for-byte.

mod common;

use dbgengine::{Engine, EngineConfig};

#[inline(never)]
extern "C" fn hit_point() {
    std::hint::black_box(());
}

#[test]
fn software_breakpoint_patches_and_restores_memory() {
    let address = hit_point as usize as u64;
    let (child, write_fd) = common::fork_waiting_child(|| {
        std::thread::sleep(std::time::Duration::from_millis(200));
    });

    let engine = Engine::attach(child.as_raw(), EngineConfig::default(), Default::default())
        .expect("attach should succeed on a freshly forked, not-yet-released child");

    let original = engine
        .read_memory(address, 4)
        .expect("reading 4 bytes at the soon-to-be-patched address should succeed");

    engine
        .set_software_breakpoint(address, 0)
        .expect("installing a software breakpoint should succeed");

    let patched = engine
        .read_memory(address, 4)
        .expect("reading back the patched bytes should succeed");
    assert_ne!(patched, original, "patched bytes must differ from the original snapshot");
    #[cfg(target_arch = "x86_64")]
    assert_eq!(patched[0], 0xCC, "x86_64 software breakpoints patch in a single int3 byte");

    engine
        .remove_breakpoint(address)
        .expect("removing the software breakpoint should succeed");

    let restored = engine
        .read_memory(address, 4)
        .expect("reading memory after removal should succeed");
    assert_eq!(restored, original, "removal must restore the exact original bytes");

    common::release_child(write_fd);
    common::reap(child);
}
