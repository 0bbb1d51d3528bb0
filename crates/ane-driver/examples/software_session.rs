// SPDX-License-Identifier: AGPL-3.0-only

//! Example: compile a network and execute it on the software service
//!
//! Walks both capability modes: a compile-only session turns a JSON
//! description into an HWX program, an execution session runs it.

use ane_driver::{CapabilityMode, Result, Session, SessionConfig, SharedSurface, SoftwareService};
use std::sync::Arc;
use std::time::Duration;

const NETWORK: &str = r#"{
    "inputs": [
        {"shape": [1, 1, 1, 1, 64], "dtype": "float16"},
        {"shape": [1, 1, 1, 1, 64], "dtype": "float16"}
    ],
    "ops": [{
        "kind": {"type": "element_wise", "op": "add"},
        "inputs": [{"input": 0}, {"input": 1}],
        "output": {"shape": [1, 1, 1, 1, 64], "dtype": "float16"},
        "activation": {"kind": "relu"}
    }]
}"#;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("ane_driver=info")
        .init();

    println!("🧠 ANE software session\n");

    let service = Arc::new(SoftwareService::new().with_latency(Duration::from_millis(5)));

    let mut compiler = Session::open(service.clone(), CapabilityMode::CompileOnly, SessionConfig::default())?;
    let handle = compiler.submit_compile(NETWORK.as_bytes())?;
    let compiled = compiler.wait_default(handle)?;
    compiler.close();

    let Some(program) = compiled.outputs.into_iter().next() else {
        println!("compile produced no program");
        return Ok(());
    };
    println!("✅ Compiled: {} bytes", program.len());

    let mut runner = Session::open(service, CapabilityMode::ProgramExecution, SessionConfig::default())?;
    runner.load_program(program.as_slice())?;

    let a: Vec<f32> = (0..64).map(|i| i as f32 * 0.25).collect();
    let b = vec![1.0f32; 64];
    let handle = runner.submit(vec![SharedSurface::from_f32(&a), SharedSurface::from_f32(&b)])?;
    let result = runner.wait(handle, Duration::from_secs(5))?;

    for (n, out) in result.outputs.iter().enumerate() {
        let values = out.to_f32();
        println!("output{n}: {} values, first {:?}", values.len(), &values[..values.len().min(4)]);
    }
    println!("\nℹ️  The software service is loopback: outputs echo the inputs.");
    Ok(())
}
