#[macro_use]
extern crate log;
extern crate pretty_env_logger;
extern crate simprobe;

use simprobe::ProbeResult;

const SIMULATED_PC: usize = 0x1000;
const LANDING_PAD: usize = 0x2000;

fn main() {
    // Top priority: probes that fault before this would crash the process.
    if let Err(err) = simprobe::init() {
        eprintln!("cannot install fault handler: {}", err);
        std::process::exit(1);
    }
    pretty_env_logger::init();
    info!("simulating {:?} on an x86_64 host", simprobe::SIMULATED_ARCH);

    // A page we are not allowed to touch, standing in for unmapped simulated memory.
    let guard = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            4096,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if guard == libc::MAP_FAILED {
        eprintln!("cannot map guard page: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }

    if let Err(err) = simprobe::registry::register(SIMULATED_PC, LANDING_PAD) {
        eprintln!("{}", err);
        std::process::exit(1);
    }

    let readable = 0u8;
    for &(name, address) in &[("readable", &readable as *const u8 as usize), ("guarded", guard as usize)] {
        info!("probing {} address {:#x} for simulated pc {:#x}", name, address, SIMULATED_PC);
        match simprobe::probe(address, SIMULATED_PC) {
            ProbeResult::Success => println!("{}: accessible", name),
            ProbeResult::Redirect(pad) => println!("{}: trapped, resume at {:#x}", name, pad),
        }
    }

    simprobe::registry::unregister(SIMULATED_PC);
    unsafe { libc::munmap(guard, 4096) };
}
