#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use blkdev_block::{AccessMode, BlockDevice, ByteDevice, DeviceOptions, FileBlockDevice};
use blkdev_types::{BlockNumber, DEFAULT_BLOCK_SIZE, DeviceGeometry};
use serde::Serialize;
use std::env;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    block_size: u32,
    block_count: u64,
    image_bytes: u64,
    trailing_bytes: u64,
    partition_offset: u64,
    partition_size: u64,
}

/// Arguments after flag extraction. Flags may appear anywhere on the line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    positional: Vec<String>,
    block_size: u32,
    count: u32,
    json: bool,
    verbose: bool,
    help: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = parse_args(env::args().skip(1))?;
    if args.help {
        print_usage();
        return Ok(());
    }
    if args.verbose {
        init_tracing();
    }

    let Some((command, operands)) = args.positional.split_first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "info" => {
            let [image] = operands else {
                bail!("info requires <image>");
            };
            info_cmd(Path::new(image), &args)
        }
        "read" => {
            let [image, block] = operands else {
                bail!("read requires <image> <block>");
            };
            read_cmd(Path::new(image), block, &args)
        }
        "fill" => {
            let [image, block, byte] = operands else {
                bail!("fill requires <image> <block> <byte>");
            };
            fill_cmd(Path::new(image), block, byte, &args)
        }
        "check" => {
            let [image] = operands else {
                bail!("check requires <image>");
            };
            check_cmd(Path::new(image), &args)
        }
        "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("blkdev-cli\n");
    println!("USAGE:");
    println!("  blkdev-cli info <image> [--block-size N] [--json]");
    println!("  blkdev-cli read <image> <block> [--count N] [--block-size N]");
    println!("  blkdev-cli fill <image> <block> <byte> [--count N] [--block-size N]");
    println!("  blkdev-cli check <image> [--block-size N]");
    println!();
    println!("  --verbose  trace every block transfer on stderr");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut parsed = CliArgs {
        positional: Vec::new(),
        block_size: DEFAULT_BLOCK_SIZE,
        count: 1,
        json: false,
        verbose: false,
        help: false,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => parsed.json = true,
            "--verbose" | "-v" => parsed.verbose = true,
            "--help" | "-h" => parsed.help = true,
            "--block-size" => {
                let value = args.next().context("--block-size requires a value")?;
                parsed.block_size = parse_number(&value, "--block-size")?;
            }
            "--count" => {
                let value = args.next().context("--count requires a value")?;
                parsed.count = parse_number(&value, "--count")?;
            }
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            _ => parsed.positional.push(arg),
        }
    }
    Ok(parsed)
}

/// Parse a decimal or `0x`-prefixed hexadecimal number into `T`.
fn parse_number<T: TryFrom<u64>>(value: &str, what: &str) -> Result<T> {
    let raw = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    }
    .with_context(|| format!("invalid {what}: {value:?}"))?;
    T::try_from(raw)
        .ok()
        .with_context(|| format!("{what} out of range: {value}"))
}

fn device_options(args: &CliArgs, access: AccessMode) -> DeviceOptions {
    DeviceOptions {
        block_size: args.block_size,
        access,
        partition: None,
        trace_io: args.verbose,
    }
}

fn open_device(path: &Path, args: &CliArgs, access: AccessMode) -> Result<FileBlockDevice> {
    let mut dev = FileBlockDevice::acquire(path, &device_options(args, access))
        .with_context(|| format!("failed to acquire {}", path.display()))?;
    dev.open()
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(dev)
}

fn transfer_len(count: u32, block_size: u32) -> Result<usize> {
    let bytes = u64::from(count) * u64::from(block_size);
    usize::try_from(bytes).with_context(|| format!("{count} blocks do not fit in memory"))
}

fn info_cmd(path: &Path, args: &CliArgs) -> Result<()> {
    let dev = FileBlockDevice::acquire(path, &device_options(args, AccessMode::ReadOnly))
        .with_context(|| format!("failed to acquire {}", path.display()))?;
    let geometry = dev.geometry();
    let image_bytes = dev
        .inner()
        .context("device released before inspection")?
        .len_bytes()
        .with_context(|| format!("failed to size {}", path.display()))?;

    let output = InfoOutput {
        path: path.display().to_string(),
        block_size: geometry.block_size.get(),
        block_count: geometry.block_count,
        image_bytes,
        trailing_bytes: DeviceGeometry::trailing_bytes(image_bytes, geometry.block_size),
        partition_offset: geometry.partition.offset.0,
        partition_size: geometry.partition.size,
    };
    dev.release();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("blkdev image: {}", output.path);
        println!("block_size: {}", output.block_size);
        println!("block_count: {}", output.block_count);
        println!("image_bytes: {}", output.image_bytes);
        println!("trailing_bytes: {}", output.trailing_bytes);
        println!(
            "partition: offset={} size={}",
            output.partition_offset, output.partition_size
        );
    }
    Ok(())
}

fn read_cmd(path: &Path, block: &str, args: &CliArgs) -> Result<()> {
    let block = BlockNumber(parse_number(block, "block")?);
    let mut dev = open_device(path, args, AccessMode::ReadOnly)?;
    let mut buf = vec![0_u8; transfer_len(args.count, dev.block_size())?];
    dev.read_blocks(block, args.count, &mut buf)
        .with_context(|| format!("failed to read {} block(s) at {block}", args.count))?;
    let base = block
        .0
        .checked_mul(u64::from(dev.block_size()))
        .context("byte offset overflows u64")?;
    dev.close()?;

    for line in hex_dump(base, &buf) {
        println!("{line}");
    }
    Ok(())
}

fn fill_cmd(path: &Path, block: &str, byte: &str, args: &CliArgs) -> Result<()> {
    let block = BlockNumber(parse_number(block, "block")?);
    let byte: u8 = parse_number(byte, "fill byte")?;
    let mut dev = open_device(path, args, AccessMode::ReadWrite)?;
    let buf = vec![byte; transfer_len(args.count, dev.block_size())?];
    dev.write_blocks(block, args.count, &buf)
        .with_context(|| format!("failed to write {} block(s) at {block}", args.count))?;
    dev.sync().context("failed to sync image")?;
    dev.close()?;
    println!(
        "filled {} block(s) at {block} with {byte:#04x}",
        args.count
    );
    Ok(())
}

fn check_cmd(path: &Path, args: &CliArgs) -> Result<()> {
    let mut dev = open_device(path, args, AccessMode::ReadWrite)?;
    let verified = check_device(&mut dev)?;
    dev.close()?;
    for block in &verified {
        println!("block {block}: ok");
    }
    println!(
        "check passed: {} block(s) verified on {}",
        verified.len(),
        path.display()
    );
    Ok(())
}

/// Round-trip the first and last block, restoring their contents.
fn check_device<D: BlockDevice>(dev: &mut D) -> Result<Vec<BlockNumber>> {
    let count = dev.block_count();
    if count == 0 {
        bail!("image holds no whole {}-byte block", dev.block_size());
    }
    let mut targets = vec![BlockNumber(0)];
    if count > 1 {
        targets.push(BlockNumber(count - 1));
    }

    for &block in &targets {
        round_trip_block(dev, block)?;
        info!(block = block.0, "block verified");
    }
    dev.sync().context("failed to sync image")?;
    Ok(targets)
}

fn round_trip_block<D: BlockDevice>(dev: &mut D, block: BlockNumber) -> Result<()> {
    let saved = dev
        .read_block(block)
        .with_context(|| format!("failed to save block {block}"))?;
    // Complement of the saved contents: every byte changes.
    let pattern: Vec<u8> = saved.as_slice().iter().map(|b| !b).collect();

    let outcome = write_and_verify(dev, block, &pattern);
    dev.write_block(block, saved.as_slice())
        .with_context(|| format!("failed to restore block {block}"))?;
    outcome?;

    let restored = dev
        .read_block(block)
        .with_context(|| format!("failed to re-read block {block}"))?;
    if restored.as_slice() != saved.as_slice() {
        bail!("block {block} differs after restore");
    }
    Ok(())
}

fn write_and_verify<D: BlockDevice>(dev: &mut D, block: BlockNumber, pattern: &[u8]) -> Result<()> {
    dev.write_block(block, pattern)
        .with_context(|| format!("failed to write pattern to block {block}"))?;
    let back = dev
        .read_block(block)
        .with_context(|| format!("failed to read back block {block}"))?;
    if let Some(at) = back
        .as_slice()
        .iter()
        .zip(pattern)
        .position(|(got, want)| got != want)
    {
        bail!("block {block}: readback mismatch at byte {at}");
    }
    Ok(())
}

/// Classic 16-bytes-per-row dump with absolute offsets and an ASCII column.
fn hex_dump(base: u64, bytes: &[u8]) -> Vec<String> {
    let mut offset = base;
    bytes
        .chunks(16)
        .map(|chunk| {
            let mut hex = String::with_capacity(49);
            for (idx, byte) in chunk.iter().enumerate() {
                if idx == 8 {
                    hex.push(' ');
                }
                let _ = write!(hex, "{byte:02x} ");
            }
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        char::from(b)
                    } else {
                        '.'
                    }
                })
                .collect();
            let line = format!("{offset:012x}  {hex:<49} |{ascii}|");
            offset = offset.saturating_add(16);
            line
        })
        .collect()
}
