//
// Print the state of every page of a process: where it sits in physical memory, how many times its
// frame is mapped, and the frame's flags.
//
// Reading /proc/kpagecount and /proc/kpageflags requires CAP_SYS_ADMIN privilege, or root.
// Without it the counts and flags are left out, and every physical address reads as zero.
//
// Usage:
//
//   cargo run --example pagemap -- <PID> [--match libc] [--absent]
//   cargo run --example pagemap -- --addr 7ffd2de4708f --addr 0x55d1b7a5e000
//   cargo run --example pagemap --features serde1 -- <PID> --json
//
// Sample output:
//
// 55d1b7a5e000-55d1b7a60000 r--p 0 fd:01 1837150 /usr/bin/cat
// 8kB
// 2
// 55d1b7a5e000 10f3e4000 3 REFERENCED UPTODATE LRU ACTIVE MMAP
// 55d1b7a5f000 10f3e5000 3 REFERENCED UPTODATE LRU ACTIVE MMAP
//

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pagemap::process::{MemoryMap, PageEntry, Process};
use pagemap::{parse_address, PageScanner, ScanConfig};

#[derive(Parser, Debug)]
#[command(name = "pagemap", about = "Show the physical pages behind the memory of a process")]
struct Args {
    /// Process to inspect, this process if omitted
    pid: Option<i32>,

    /// Look up these virtual addresses instead of walking the mappings
    #[arg(long = "addr", value_name = "ADDR")]
    addresses: Vec<String>,

    /// Base of the --addr values
    #[arg(long, default_value_t = 16)]
    radix: u32,

    /// Only scan mappings whose pathname contains this string
    #[arg(long = "match", value_name = "SUBSTRING")]
    pattern: Option<String>,

    /// Also list pages that are swapped out or absent
    #[arg(long, action = clap::ArgAction::SetTrue)]
    absent: bool,

    /// Dump the scan as JSON (requires the serde1 feature)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Where procfs is mounted
    #[arg(long, value_name = "DIR", default_value = "/proc")]
    proc_root: PathBuf,
}

#[cfg(feature = "serde1")]
fn dump<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(not(feature = "serde1"))]
fn dump<T>(_value: &T) -> Result<()> {
    anyhow::bail!("--json requires building with the serde1 feature")
}

fn print_maps(maps: &[MemoryMap], page_size: u64, absent: bool) {
    for map in maps {
        println!("{}", map);
        println!("{}kB", map.address.size() / 1024);
        println!("{}", map.address.page_count(page_size));
        for address in map.address.pages(page_size) {
            match map.page(address) {
                Some(entry) if absent || entry.present => println!("{:x} {}", address, entry),
                _ => {}
            }
        }
    }
}

fn print_addresses(results: &[(u64, Option<PageEntry>)]) {
    for (address, entry) in results {
        match entry {
            Some(entry) => println!("{:x} {}", address, entry),
            None => println!("{:x} unavailable", address),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !rustix::process::geteuid().is_root() {
        eprintln!("WARNING: Access to /proc/kpagecount and /proc/kpageflags requires root, re-run with sudo");
    }

    let config = ScanConfig {
        proc_root: args.proc_root.clone(),
        ..ScanConfig::default()
    };

    let process = match args.pid {
        Some(pid) => config
            .process(pid)
            .with_context(|| format!("Can't open process {}", pid))?,
        None => Process::myself().context("Can't open /proc/self")?,
    };

    let mut scanner = PageScanner::open(&process, &config)
        .with_context(|| format!("Can't open the page tables of process {}", process.pid))?;

    if !args.addresses.is_empty() {
        let addresses = args
            .addresses
            .iter()
            .map(|a| parse_address(a, args.radix).with_context(|| format!("Bad address {:?}", a)))
            .collect::<Result<Vec<u64>>>()?;

        let results = scanner.lookup_addresses(&addresses);
        if args.json {
            return dump(&results);
        }
        print_addresses(&results);
        return Ok(());
    }

    let maps = process
        .maps()
        .with_context(|| format!("Can't read the memory maps of process {}", process.pid))?;
    let pattern = args.pattern.as_deref().unwrap_or("");
    let maps = scanner.scan(maps, |path| path.contains(pattern));

    if args.json {
        return dump(&maps);
    }
    print_maps(&maps, scanner.page_size(), args.absent);

    Ok(())
}
