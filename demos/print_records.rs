use memspace_rs::MemorySpace;
use memspace_rs::runtime::texture::Int2;
use memspace_rs::runtime::{self, TrackedBuffer};
use memspace_rs::space::access;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Memory Space Access Matrix ===");
    println!("{:<24} {:<24} assign access deepcopy", "executing", "target");
    for a in MemorySpace::ALL {
        for b in MemorySpace::ALL {
            let e = access::query(a, b);
            println!(
                "{:<24} {:<24} {:<6} {:<6} {}",
                a.name(),
                b.name(),
                e.assignable,
                e.accessible,
                e.deepcopy
            );
        }
    }

    let rt = runtime::acquire()?;

    let weights = TrackedBuffer::new(rt.clone(), MemorySpace::RestrictedDevice, "weights", 1 << 20)?;
    let staging = TrackedBuffer::new(rt.clone(), MemorySpace::PinnedHost, "staging", 64 * 1024)?;
    let _scratch = TrackedBuffer::new(rt.clone(), MemorySpace::Device, "scratch", 4096)?;

    rt.write_from_host(staging.as_ptr(), &[1u8; 1024])?;
    let tex = weights.attach_texture::<Int2>()?;
    println!("\n[+] Attached texture {} to \"weights\"", tex.0);

    println!();
    for space in MemorySpace::ALL {
        print!("{}", rt.report(space, true));
    }

    drop((weights, staging, _scratch));
    runtime::release();
    Ok(())
}
