//! Example of quota enforcement against hostile guest code.
//!
//! Run with: cargo run --example resource_limits

use script_sandbox_rs::prelude::*;

fn main() -> Result<()> {
    println!("=== Instruction quota ===");
    let mut engine = Engine::new(4 * 1024 * 1024, 10_000, 10.0)?;
    match engine.sandbox_eval("spin.rb", "loop do\nend") {
        Ok(_) => unreachable!(),
        Err(e) => println!("caught: {e}"),
    }
    // The engine is latched; every further operation except stat fails.
    match engine.sandbox_eval("next.rb", "1 + 1") {
        Ok(_) => unreachable!(),
        Err(e) => println!("after the fault: {e}"),
    }
    println!("instructions spent: {}", engine.stat()?.instructions);

    println!("\n=== Memory quota ===");
    let mut engine = Engine::new(512 * 1024, i64::MAX, 10.0)?;
    match engine.sandbox_eval("grow.rb", "a = []\nloop { a << (\"x\" * 1000) }") {
        Ok(_) => unreachable!(),
        Err(e) => println!("caught: {e}"),
    }

    println!("\n=== Time quota ===");
    let mut engine = Engine::new(4 * 1024 * 1024, i64::MAX, 0.05)?;
    match engine.sandbox_eval("spin.rb", "loop do\nend") {
        Ok(_) => unreachable!(),
        Err(e) => println!("caught: {e}"),
    }

    println!("\n=== Stack margin ===");
    let mut engine = Engine::new(4 * 1024 * 1024, 1_000_000, 10.0)?;
    let source = "def dig\n  dig\nend\ndig";
    match engine.sandbox_eval("recurse.rb", source) {
        Ok(_) => unreachable!(),
        Err(e) => println!("caught: {e}"),
    }

    Ok(())
}
