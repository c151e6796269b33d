//! blankvm CLI tool
//!
//! Runs a flat binary image in a KVM virtual machine, with the guest's
//! serial port wired to this process's stdin and stdout.

use std::process;

use blankvm::{execute_image, parse_num, CpuMode, SerialConsole, VmConfig};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_args(&args[1..]) {
        Some(config) => config,
        None => {
            print_usage();
            process::exit(1);
        }
    };

    let mut console = SerialConsole::new();
    if let Err(e) = execute_image(config, &mut console) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Option<VmConfig> {
    let mut mode = CpuMode::Real;
    let mut memory_size = blankvm::DEFAULT_MEMORY_SIZE;
    let mut entry_point = 0;
    let mut page_table = None;
    let mut image: Option<String> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-R" => mode = CpuMode::Real,
            "-P" => mode = CpuMode::Protected,
            "-L" => mode = CpuMode::Long,
            "-m" => {
                i += 1;
                memory_size = parse_num(args.get(i)?)?;
            }
            "-e" => {
                i += 1;
                entry_point = parse_num(args.get(i)?)?;
            }
            "-p" => {
                i += 1;
                page_table = Some(parse_num(args.get(i)?)?);
            }
            arg if arg.starts_with('-') => return None,
            arg => {
                // The single positional argument is the image path.
                if image.is_some() {
                    return None;
                }
                image = Some(arg.to_string());
            }
        }
        i += 1;
    }

    let mut config = VmConfig::new(image?);
    config.mode = mode;
    config.memory_size = memory_size;
    config.entry_point = entry_point;
    config.page_table = page_table;
    Some(config)
}

fn print_usage() {
    eprintln!("Usage: blankvm [-RPL] [-m mem_size] [-e entry] [-p page_table] image");
    eprintln!();
    eprintln!("  -R    real mode (16-bit)");
    eprintln!("  -P    protected mode (32-bit)");
    eprintln!("  -L    long mode (64-bit)");
    eprintln!("  -m    memory size");
    eprintln!("  -e    entry point address");
    eprintln!("  -p    page table address (only for long mode)");
    eprintln!();
}
