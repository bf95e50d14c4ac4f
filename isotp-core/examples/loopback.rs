//! Loopback ISO-TP demo
//!
//! Runs a diagnostic-style request/response exchange between two sessions
//! connected by an in-process channel link. The "ECU" thread echoes every
//! request back with the first byte raised by 0x40, like a UDS positive
//! response.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --example loopback [parameters.toml]

use anyhow::{Context, Result};
use isotp_core::{channel_pair, load_parameters, ProtocolParameters, Session};
use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

fn main() -> Result<()> {
    env_logger::init();

    let params = match env::args().nth(1).map(PathBuf::from) {
        Some(path) => load_parameters(&path)
            .with_context(|| format!("Failed to load parameters from {:?}", path))?,
        None => ProtocolParameters::DEFAULT.with_block_size(8)?,
    };
    println!("Parameters: {:?}", params);

    let (tester_link, ecu_link) = channel_pair();
    let ecu = thread::spawn(move || -> Result<usize> {
        let mut session = Session::new(ecu_link, params);
        let mut served = 0;
        while let Ok(mut request) = session.receive() {
            if let Some(service) = request.first_mut() {
                *service = service.wrapping_add(0x40);
            }
            session.send(&request)?;
            served += 1;
        }
        Ok(served)
    });

    let mut tester = Session::new(tester_link, params);
    for len in [3usize, 20, 300, 4000] {
        let mut request = vec![0x22; len];
        request[1..].iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);

        let started = Instant::now();
        tester.send(&request)?;
        let response = tester.receive()?;

        println!(
            "{:>5} bytes -> {:>5} bytes, SID 0x{:02X}, {:?}",
            request.len(),
            response.len(),
            response[0],
            started.elapsed()
        );
    }

    // Closing the tester link ends the ECU loop
    drop(tester);
    let served = ecu.join().expect("ECU thread panicked")?;
    println!("ECU served {} requests", served);
    Ok(())
}
