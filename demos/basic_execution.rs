//! Basic example of running a guest script in the sandbox.
//!
//! Run with: cargo run --example basic_execution

use script_sandbox_rs::prelude::*;

fn main() -> Result<()> {
    // 4 MiB of guest memory, 100k instructions, 500 ms of wall time.
    let mut engine = Engine::new(4 * 1024 * 1024, 100_000, 0.5)?;

    // Hand the guest its input as instance variables of the top-level
    // object.
    engine.inject("@subtotal", &HostValue::Int(1900))?;
    engine.inject("@quantity", &HostValue::Int(3))?;

    println!("=== Evaluate a script ===");
    let source = "\
def total(subtotal, quantity)
  subtotal * quantity
end

@total = total(@subtotal, @quantity)";
    match engine.sandbox_eval("pricing.rb", source) {
        Ok(value) => println!("eval result: {value:?}"),
        Err(e) => eprintln!("eval failed: {e}"),
    }

    println!("\n=== Extract the output ===");
    println!("@total = {:?}", engine.extract("@total")?);

    println!("\n=== Guest exceptions stay inside ===");
    match engine.sandbox_eval("broken.rb", "raise \"the guest is unhappy\"") {
        Ok(_) => unreachable!(),
        Err(e) => println!("caught: {e}"),
    }

    let stat = engine.stat()?;
    println!("\ninstructions: {}", stat.instructions);
    println!("guest memory in use: {} bytes", stat.memory);
    Ok(())
}
