//! Minimal example: one node through a full seal lifecycle on disk.
//!
//! Initializes a file-backed node, unseals it with a quorum of shares,
//! stores a secret, reseals, then reopens the same directory as if the
//! process had restarted.
//! Run with: `cargo run --example seal_lifecycle`
//!
//! Set `RUST_LOG=sealvault=debug` to watch the barrier and seal transitions.

use sealvault::{Collaborators, Core, CoreConfig, SealState, StorageConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // 1. Setup
    let dir = tempfile::tempdir()?;
    let config = CoreConfig::new(StorageConfig::File {
        path: dir.path().join("data"),
    });
    let core = Core::open(&config, Collaborators::default())?;

    // 2. Initialize with 3 of 5 shares
    let init = core.initialize(3, 5)?;
    println!("Initialized. Shares (hand one to each operator):");
    for share in &init.shares {
        println!("  {}", share.to_hex());
    }
    println!("Root token: {}", init.root_token);

    // 3. Unseal with three of them
    for share in &init.shares[1..4] {
        let state = core.submit_share(share.clone())?;
        println!("Submitted share {}: {:?}", share.index(), state);
    }

    // 4. Write and read back a secret
    core.write("secret/foo", br#"{"zork":"quux"}"#)?;
    let value = core.read("secret/foo")?;
    println!("secret/foo = {}", String::from_utf8_lossy(&value));

    // 5. Reseal; the data is unreachable again
    core.reseal();
    match core.read("secret/foo") {
        Err(e) => println!("Read while sealed: {}", e),
        Ok(_) => println!("SECURITY FAILURE: read succeeded while sealed!"),
    }
    drop(core);

    // 6. Restart from the same directory with a different quorum
    let core = Core::open(&config, Collaborators::default())?;
    let status = core.seal_status()?;
    println!(
        "After restart: sealed={} threshold={} total={}",
        status.sealed, status.threshold, status.total_shares
    );
    let mut state = SealState::Sealed;
    for share in [&init.shares[0], &init.shares[2], &init.shares[4]] {
        state = core.submit_share(share.clone())?;
    }
    println!("State: {:?}", state);
    println!(
        "secret/foo = {}",
        String::from_utf8_lossy(&core.read("secret/foo")?)
    );

    Ok(())
}
