use anyhow::{Context, Result};
use candle_core::Device;
use patchcore_inspect::memory_bank::MemoryBank;
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("Usage: inspect_memory_bank <path_to_memory_bank.safetensors>");
        return Ok(());
    }

    let path = Path::new(&args[1]);
    println!("Inspecting memory bank: {}", path.display());

    let bank = MemoryBank::load(path, &Device::Cpu)
        .with_context(|| format!("loading {}", path.display()))?;

    println!("\n--- Tensor ---");
    println!("Shape: {:?}", bank.shape());
    println!("DType: {:?}", bank.vectors().dtype());

    println!("\n--- Metadata ---");
    if bank.metadata().is_empty() {
        println!("(none)");
    }
    for (key, value) in bank.metadata() {
        println!("{}: {}", key, value);
    }

    println!("\n--- Effective overrides ---");
    println!("Threshold: {:?}", bank.threshold());
    println!("Layers: {:?}", bank.layers());

    Ok(())
}
