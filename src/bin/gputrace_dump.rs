//! Offline binary utilities: split fat containers and dump the static
//! analysis of a kernel, without a driver or a GPU.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gputrace_binary::{split, ImageSummary, Kernel, MachineImage};
use gputrace_isa::RegClass;
use serde_json::json;

#[derive(Parser)]
#[command(name = "gputrace-dump", version)]
#[command(about = "Inspect GPU binary containers and kernels")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Split a fat container and list its sub-images.
    Fatbin {
        /// Container or image file.
        path: PathBuf,
        /// Dump each machine image into this directory.
        #[arg(long)]
        dump_dir: Option<PathBuf>,
    },
    /// Disassemble and analyze one kernel of a machine image.
    Kernel {
        /// Container or image file.
        path: PathBuf,
        /// Mangled kernel name.
        #[arg(long)]
        name: String,
        /// Directory of ISA descriptor files.
        #[arg(long)]
        isa: PathBuf,
        /// Architecture tag to select the image, e.g. "90".
        #[arg(long)]
        arch: String,
    },
}

fn main() {
    env_logger::Builder::from_default_env().init();
    let opts = Opts::parse();
    if let Err(e) = run(opts) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> Result<(), Box<dyn std::error::Error>> {
    match opts.command {
        Command::Fatbin { path, dump_dir } => {
            let bytes = std::fs::read(&path)?;
            let container = split(&bytes)?;

            let machine: Vec<ImageSummary> = container
                .machine_images
                .iter()
                .map(|image| ImageSummary {
                    arch: image.arch.clone(),
                    size: image.bytes.len(),
                })
                .collect();
            let ir: Vec<ImageSummary> = container
                .ir_images
                .iter()
                .map(|image| ImageSummary {
                    arch: image.arch.clone(),
                    size: image.text.len(),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "machine_images": machine,
                    "ir_images": ir,
                }))?
            );

            if let Some(dir) = dump_dir {
                std::fs::create_dir_all(&dir)?;
                let stem = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "image".into());
                for (index, image) in container.machine_images.iter().enumerate() {
                    let out = dir.join(format!("{stem}_{index}_sm{}.cubin", image.arch));
                    image.dump(&out)?;
                    eprintln!("wrote {}", out.display());
                }
            }
        }
        Command::Kernel {
            path,
            name,
            isa,
            arch,
        } => {
            let bytes = std::fs::read(&path)?;
            let container = split(&bytes)?;
            let image: &MachineImage = container
                .machine_images
                .iter()
                .find(|image| gputrace_binary::is_arch_equal(&image.arch, &arch, true))
                .ok_or_else(|| format!("no machine image for arch {arch}"))?;

            let metadata_arch = gputrace::load_arch(&arch, &isa)?;
            let kernel = Kernel::extract(image, &name, &*metadata_arch)?;
            println!("{}", serde_json::to_string_pretty(&kernel_report(&kernel))?);
        }
    }
    Ok(())
}

fn kernel_report(kernel: &Kernel) -> serde_json::Value {
    let instructions: Vec<_> = kernel
        .instructions
        .iter()
        .enumerate()
        .map(|(index, instr)| {
            json!({
                "pc": kernel.pc_of(index),
                "decode": instr.to_string(),
            })
        })
        .collect();

    let blocks: Vec<_> = kernel
        .cfg()
        .blocks
        .iter()
        .map(|block| {
            let id = block.id as usize;
            let outgoing: Vec<_> = kernel
                .cfg()
                .successors(id)
                .map(|edge| {
                    json!({
                        "to_block": edge.to_block,
                        "from_pc": edge.from_pc,
                        "to_pc": edge.to_pc,
                    })
                })
                .collect();
            let live_in: Vec<u64> = kernel
                .live_in(id, RegClass::General)
                .into_iter()
                .collect();
            let live_out: Vec<u64> = kernel
                .live_out(id, RegClass::General)
                .into_iter()
                .collect();
            json!({
                "id": block.id,
                "base_pc": block.base_pc,
                "end_pc": block.end_pc,
                "outgoing_edges": outgoing,
                "live_in": live_in,
                "live_out": live_out,
            })
        })
        .collect();

    json!({
        "mangled_name": kernel.mangled_name.clone(),
        "arch": kernel.arch.clone(),
        "param_sizes": kernel.param_sizes.clone(),
        "param_offsets": kernel.param_offsets.clone(),
        "instructions": instructions,
        "basic_blocks": blocks,
        "debug_info": kernel.debug.clone(),
    })
}
