//! mirrorctl - inspect a beacon-mirror database
//!
//! Prints stored slots, epochs, the simulated deposit queue, archived blobs
//! and indexer health as pretty JSON.

use beacon_mirror::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
