//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the [ccflash]
//! command-line application, and are likely not of much use otherwise.
//!
//! [ccflash]: https://crates.io/crates/ccflash

use std::{
    fs,
    io::BufWriter,
    path::{Path, PathBuf},
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Table};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use miette::{bail, miette, IntoDiagnostic, Result, WrapErr};
use strum::VariantNames;

use self::config::Config;
use crate::{
    command::CommandType,
    flasher::Flasher,
    image::{bin, hex, AddressWidth, Image},
    progress::ProgressCallbacks,
    targets::ChipInfo,
};

pub mod config;

// Since as of `clap@4.0.x` the `possible_values` attribute is no longer
// present, we must use the more convoluted `value_parser` attribute instead.
// Since this is a bit tedious, we'll use a helper macro to abstract away all
// the cruft. It's important to note that this macro assumes the
// `strum::VariantNames` trait has been implemented for the provided type,
// and that the provided type is in scope when calling this macro.
//
// See this comment for details:
// https://github.com/clap-rs/clap/discussions/4264#discussioncomment-3737696
#[doc(hidden)]
#[macro_export]
macro_rules! clap_enum_variants {
    ($e: ty) => {{
        use clap::builder::TypedValueParser;
        clap::builder::PossibleValuesParser::new(<$e>::VARIANTS).map(|s| s.parse::<$e>().unwrap())
    }};
}

pub use clap_enum_variants;

/// Establish a connection with a target device
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// BCM pin number of the RESET line
    #[arg(long, value_name = "PIN")]
    pub reset: Option<u8>,
    /// BCM pin number of the debug clock line
    #[arg(long, value_name = "PIN")]
    pub dc: Option<u8>,
    /// BCM pin number of the debug data line
    #[arg(long, value_name = "PIN")]
    pub dd: Option<u8>,
    /// Debug clock half-period in nanoseconds
    #[arg(long, value_name = "NANOS")]
    pub delay: Option<u64>,
    /// Number of retries while waiting for a command response
    #[arg(long, value_name = "COUNT")]
    pub retries: Option<u32>,
}

/// File formats for reading and writing memory contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FileFormat {
    /// Intel hexadecimal object file
    Hex,
    /// Binary envelope with entry points and region headers
    Bin,
    /// Plain bytes, no structure
    Raw,
}

/// An `address:size` span on the command line
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub address: u32,
    pub size: u32,
}

/// Parse a number, accepting a `0x` prefix for hexadecimal.
pub fn parse_number(input: &str) -> Result<u32, String> {
    let input = input.trim();
    let (digits, radix) = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(digits) => (digits, 16),
        None => (input, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

/// Parse an `address:size` span.
pub fn parse_memory_range(input: &str) -> Result<MemoryRange, String> {
    let (address, size) = input
        .split_once(':')
        .ok_or_else(|| String::from("expected `address:size`"))?;

    Ok(MemoryRange {
        address: parse_number(address)?,
        size: parse_number(size)?,
    })
}

fn parse_hex_bytes(input: &str) -> Result<Vec<u8>> {
    let digits: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("hex data must have an even number of digits");
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| miette!("invalid hex digit in `{}`", &digits[i..i + 2]))
        })
        .collect()
}

/// Select the pin interface and establish a connection with a target device
#[cfg(feature = "raspberry")]
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Flasher> {
    use crate::interface::GpioInterface;

    let reset = args
        .reset
        .or(config.gpio.reset)
        .ok_or_else(|| miette!("No RESET pin configured; pass --reset or run `ccflash set-pins`"))?;
    let dc = args
        .dc
        .or(config.gpio.dc)
        .ok_or_else(|| miette!("No DC pin configured; pass --dc or run `ccflash set-pins`"))?;
    let dd = args
        .dd
        .or(config.gpio.dd)
        .ok_or_else(|| miette!("No DD pin configured; pass --dd or run `ccflash set-pins`"))?;
    let delay = args.delay.unwrap_or(config.gpio.delay_nanos);

    info!("Connecting via GPIO {reset}/{dc}/{dd}...");

    let interface = GpioInterface::new(reset, dc, dd, delay)
        .into_diagnostic()
        .wrap_err("Failed to claim the debug GPIO lines")?;

    let mut flasher = Flasher::connect(Box::new(interface))?;
    if let Some(retries) = args.retries {
        flasher.connection().set_retries(retries);
    }

    Ok(flasher)
}

/// Select the pin interface and establish a connection with a target device
#[cfg(not(feature = "raspberry"))]
pub fn connect(_args: &ConnectArgs, _config: &Config) -> Result<Flasher> {
    Err(crate::Error::NoInterface.into())
}

/// Connect to a target device and print information about its chip
pub fn board_info(args: &ConnectArgs, config: &Config) -> Result<()> {
    let flasher = connect(args, config)?;
    print_board_info(flasher.device_info());

    Ok(())
}

fn print_board_info(info: &ChipInfo) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS);

    let mut row = |name: &str, value: String| {
        table.add_row(vec![
            Cell::new(name).add_attribute(Attribute::Bold),
            Cell::new(value),
        ]);
    };

    row("Chip", info.chip.to_string());
    row("Revision", format!("{:#04x}", info.revision));
    row(
        "Debug interface",
        String::from(if info.is_locked { "locked" } else { "unlocked" }),
    );

    if !info.is_locked {
        row("Flash", format_size(info.flash_size));
        row("Writable flash", format!("{} bytes", info.writable_flash_size));
        row("Flash bank size", format_size(info.flash_bank_size));
        row("Flash page size", format_size(info.flash_page_size));
        row("Flash pages", info.flash_pages.to_string());
        row("SRAM", format_size(info.sram_size));
        if !info.ieee_address.is_empty() {
            let address: Vec<String> = info
                .ieee_address
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect();
            row("IEEE address", address.join(":"));
        }
    }

    println!("{table}");
}

fn format_size(bytes: u32) -> String {
    if bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{bytes} bytes")
    }
}

/// Issue a raw debug command
#[derive(Debug, Args)]
pub struct ExecCommandArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Debug command to issue
    #[arg(value_parser = clap_enum_variants!(CommandType))]
    command: CommandType,
    /// Additional command data as hex digits
    #[arg(value_name = "HEX")]
    data: Option<String>,
}

/// Connect to a target device and issue a raw debug command
pub fn exec_command(args: &ExecCommandArgs, config: &Config) -> Result<()> {
    let payload = parse_hex_bytes(args.data.as_deref().unwrap_or(""))?;

    let mut flasher = connect(&args.connect_args, config)?;
    let word = flasher.connection().command(args.command, &payload)?;
    println!("{word:#06x}");

    Ok(())
}

/// Execute a CPU instruction
#[derive(Debug, Args)]
pub struct ExecInstructionArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Instruction bytes as hex digits
    #[arg(value_name = "HEX")]
    instruction: String,
}

/// Execute a CPU instruction on a target device and print the resulting
/// accumulator value
pub fn exec_instruction(args: &ExecInstructionArgs, config: &Config) -> Result<()> {
    let instruction = parse_hex_bytes(&args.instruction)?;

    let mut flasher = connect(&args.connect_args, config)?;
    let accumulator = flasher.execute_instruction(&instruction)?;
    println!("A = {accumulator:#04x}");

    Ok(())
}

/// Read a memory or flash range
#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Range to read, as `address:size`
    #[arg(value_parser = parse_memory_range)]
    range: MemoryRange,
    /// File to save the data to; dumps to stdout when omitted
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,
    /// Format of the output file
    #[arg(long, value_enum, default_value_t = FileFormat::Hex)]
    format: FileFormat,
}

/// Read a range of XDATA memory
pub fn read_memory(args: &ReadArgs, config: &Config) -> Result<()> {
    let range = args.range;
    check_xdata_range(range)?;

    let mut flasher = connect(&args.connect_args, config)?;
    let mut data = vec![0u8; range.size as usize];
    flasher.read_memory(range.address as u16, &mut data)?;

    save_output(&data, range.address, args.file.as_deref(), args.format)
}

/// Read a range of flash memory
pub fn read_flash(args: &ReadArgs, config: &Config) -> Result<()> {
    let range = args.range;

    let mut flasher = connect(&args.connect_args, config)?;
    let mut data = vec![0u8; range.size as usize];
    let read = flasher.read_flash(range.address, &mut data)?;
    data.truncate(read as usize);

    save_output(&data, range.address, args.file.as_deref(), args.format)
}

/// Per-page operation arguments
#[derive(Debug, Args)]
pub struct ReadPageArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Flash page number
    page: u32,
    /// File to save the data to; dumps to stdout when omitted
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,
    /// Format of the output file
    #[arg(long, value_enum, default_value_t = FileFormat::Hex)]
    format: FileFormat,
}

/// Read one flash page
pub fn read_page(args: &ReadPageArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config)?;
    let data = flasher.read_flash_page(args.page)?;
    let address = args.page * flasher.device_info().flash_page_size;

    save_output(&data, address, args.file.as_deref(), args.format)
}

/// Data source for write operations
#[derive(Debug, Args)]
pub struct InputArgs {
    /// Input file with the data to write
    #[arg(value_name = "FILE", required_unless_present = "data")]
    file: Option<PathBuf>,
    /// Inline data as hex digits, instead of a file
    #[arg(short = 'd', long, value_name = "HEX", conflicts_with = "file")]
    data: Option<String>,
    /// Format of the input file
    #[arg(long, value_enum, default_value_t = FileFormat::Hex)]
    format: FileFormat,
    /// Base address; required for raw files and inline data, selects a
    /// window of the image together with --size otherwise
    #[arg(short = 'a', long, value_name = "ADDR", value_parser = parse_number)]
    address: Option<u32>,
    /// Number of bytes to take from the input
    #[arg(short = 's', long, value_name = "SIZE", value_parser = parse_number)]
    size: Option<u32>,
    /// Byte offset into a raw input file
    #[arg(long, value_name = "OFFSET", value_parser = parse_number)]
    offset: Option<u32>,
}

impl InputArgs {
    /// Resolve the input into `(address, data)` segments.
    fn segments(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        if let Some(data) = &self.data {
            let address = self
                .address
                .ok_or_else(|| miette!("--address is required with inline data"))?;
            let mut bytes = parse_hex_bytes(data)?;
            if let Some(size) = self.size {
                bytes.truncate(size as usize);
            }
            return Ok(vec![(address, bytes)]);
        }

        let path = self.file.as_deref().expect("clap enforces file or data");
        match self.format {
            FileFormat::Raw => {
                let address = self
                    .address
                    .ok_or_else(|| miette!("--address is required for raw input"))?;
                let bytes = fs::read(path)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
                let offset = self.offset.unwrap_or(0) as usize;
                if offset > bytes.len() {
                    bail!("--offset points past the end of {}", path.display());
                }
                let mut bytes = bytes[offset..].to_vec();
                if let Some(size) = self.size {
                    bytes.truncate(size as usize);
                }
                Ok(vec![(address, bytes)])
            }
            format => {
                let image = load_image(path, format, None, false)?;
                match (self.address, self.size) {
                    (Some(address), Some(size)) => {
                        let data = image.copy_out(address, size as usize)?;
                        Ok(vec![(address, data)])
                    }
                    (Some(_), None) => bail!("--size is required with --address for {format} input"),
                    _ => Ok(image
                        .regions()
                        .iter()
                        .map(|region| (region.base_address(), region.to_bytes()))
                        .collect()),
                }
            }
        }
    }
}

/// Write to memory or flash
#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Input data
    #[clap(flatten)]
    input: InputArgs,
    /// Read back and compare the written data
    #[arg(long)]
    verify: bool,
}

/// Write to XDATA memory
pub fn write_memory(args: &WriteArgs, config: &Config) -> Result<()> {
    let segments = args.input.segments()?;
    let mut flasher = connect(&args.connect_args, config)?;

    for (address, data) in &segments {
        check_xdata_range(MemoryRange {
            address: *address,
            size: data.len() as u32,
        })?;
        flasher.write_memory(*address as u16, data, args.verify)?;
        info!("Wrote {} bytes at {:#06x}", data.len(), address);
    }

    Ok(())
}

/// Write to flash
pub fn write_flash(args: &WriteArgs, config: &Config) -> Result<()> {
    let segments = args.input.segments()?;
    let mut flasher = connect(&args.connect_args, config)?;
    flasher.set_progress(Some(Box::new(FlashProgress::default())));

    for (address, data) in &segments {
        let written = flasher.write_flash(*address, data, args.verify)?;
        info!("Wrote {} bytes at {:#010x}", written, address);
    }

    Ok(())
}

/// Write one flash page
#[derive(Debug, Args)]
pub struct WritePageArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Flash page number
    page: u32,
    /// Input data; must be exactly one page
    #[clap(flatten)]
    input: InputArgs,
    /// Read back and compare the written data
    #[arg(long)]
    verify: bool,
}

/// Write one flash page
pub fn write_page(args: &WritePageArgs, config: &Config) -> Result<()> {
    let segments = args.input.segments()?;
    let [(_, data)] = segments.as_slice() else {
        bail!("page input must be a single contiguous segment");
    };

    let mut flasher = connect(&args.connect_args, config)?;
    flasher.write_flash_page(args.page, data, args.verify)?;
    info!("Wrote page {}", args.page);

    Ok(())
}

/// A single-page operation
#[derive(Debug, Args)]
pub struct PageArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Flash page number
    page: u32,
}

/// Erase one flash page
pub fn erase_page(args: &PageArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config)?;
    flasher.erase_flash_page(args.page)?;
    info!("Erased page {}", args.page);

    Ok(())
}

/// Query the lock state of one flash page
pub fn page_locked(args: &PageArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config)?;
    let locked = flasher.is_flash_page_locked(args.page)?;
    println!(
        "Page {} is {}",
        args.page,
        if locked { "locked" } else { "unlocked" }
    );

    Ok(())
}

/// Lock or unlock a range of flash pages
#[derive(Debug, Args)]
pub struct LockPagesArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// First page of the range
    start_page: u32,
    /// Number of pages
    #[arg(default_value_t = 1)]
    pages: u32,
}

/// Lock a range of flash pages
pub fn lock_pages(args: &LockPagesArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config)?;
    flasher.lock_flash_pages(args.start_page, args.pages)?;
    info!("Locked {} page(s) from page {}", args.pages, args.start_page);

    Ok(())
}

/// Unlock a range of flash pages
pub fn unlock_pages(args: &LockPagesArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config)?;
    flasher.unlock_flash_pages(args.start_page, args.pages)?;
    info!(
        "Unlocked {} page(s) from page {}",
        args.pages, args.start_page
    );

    Ok(())
}

/// Erase the entire flash
pub fn erase_flash(args: &ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(args, config)?;
    flasher.erase_flash()?;
    info!("Flash erased");

    Ok(())
}

/// Permanently lock the debug interface
pub fn lock_debug(args: &ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(args, config)?;
    flasher.lock_debug_interface()?;
    info!("Debug interface locked");

    Ok(())
}

/// Convert between image file formats
#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Input file
    input: PathBuf,
    /// Output file
    output: PathBuf,
    /// Format of the input file
    #[arg(long, value_enum, default_value_t = FileFormat::Hex)]
    from: FileFormat,
    /// Format of the output file
    #[arg(long, value_enum, default_value_t = FileFormat::Bin)]
    to: FileFormat,
    /// Base address for raw input
    #[arg(short = 'a', long, value_name = "ADDR", value_parser = parse_number)]
    address: Option<u32>,
    /// Data bytes per record for hex output
    #[arg(long, value_name = "LENGTH", default_value_t = hex::DEFAULT_RECORD_LENGTH)]
    record_length: u8,
    /// Force the addressing width instead of deriving it from the data
    #[arg(long, value_enum)]
    addressing: Option<AddressWidth>,
    /// Skip unknown hex record types instead of failing
    #[arg(long)]
    ignore_unknown: bool,
}

/// Convert an image file into another format
pub fn convert(args: &ConvertArgs) -> Result<()> {
    let image = match args.from {
        FileFormat::Raw => {
            let address = args
                .address
                .ok_or_else(|| miette!("--address is required for raw input"))?;
            let bytes = fs::read(&args.input)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to read {}", args.input.display()))?;
            let mut image = match args.addressing {
                Some(width) => Image::with_address_width(width),
                None => Image::new(),
            };
            image.insert(address, &bytes)?;
            image
        }
        format => load_image(&args.input, format, args.addressing, args.ignore_unknown)?,
    };

    for (i, region) in image.regions().iter().enumerate() {
        info!(
            "mem{}: {:#010x} ~ {:#010x}, {} bytes",
            i,
            region.base_address(),
            region.end_address(),
            region.len()
        );
    }

    save_image(&image, &args.output, args.to, args.record_length)
}

/// Store the GPIO wiring in the configuration file
#[derive(Debug, Args)]
pub struct SetPinsArgs {
    /// BCM pin number of the RESET line
    #[arg(long, value_name = "PIN")]
    reset: u8,
    /// BCM pin number of the debug clock line
    #[arg(long, value_name = "PIN")]
    dc: u8,
    /// BCM pin number of the debug data line
    #[arg(long, value_name = "PIN")]
    dd: u8,
    /// Debug clock half-period in nanoseconds
    #[arg(long, value_name = "NANOS", default_value_t = 0)]
    delay: u64,
}

/// Remember the GPIO wiring for future invocations
pub fn set_pins(args: &SetPinsArgs, config: &Config) -> Result<()> {
    config.save_with(|config| {
        config.gpio.reset = Some(args.reset);
        config.gpio.dc = Some(args.dc);
        config.gpio.dd = Some(args.dd);
        config.gpio.delay_nanos = args.delay;
    })?;
    info!("Saved GPIO configuration");

    Ok(())
}

fn check_xdata_range(range: MemoryRange) -> Result<()> {
    if range.address > 0xffff || range.address as u64 + range.size as u64 > 0x1_0000 {
        bail!(
            "range {:#x}:{:#x} does not fit the 16-bit XDATA space",
            range.address,
            range.size
        );
    }
    Ok(())
}

fn load_image(
    path: &Path,
    format: FileFormat,
    width: Option<AddressWidth>,
    ignore_unknown: bool,
) -> Result<Image> {
    let bytes = fs::read(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;

    let image = match format {
        FileFormat::Hex => hex::decode(&bytes, width, ignore_unknown)?,
        FileFormat::Bin => bin::decode(&bytes[..], width)?,
        FileFormat::Raw => bail!("raw input carries no addresses; pass --address"),
    };

    Ok(image)
}

fn save_image(image: &Image, path: &Path, format: FileFormat, record_length: u8) -> Result<()> {
    use std::io::Write;

    let file = fs::File::create(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    match format {
        FileFormat::Hex => hex::encode(image, &mut writer, record_length)?,
        FileFormat::Bin => bin::encode(image, &mut writer)?,
        FileFormat::Raw => {
            let [region] = image.regions() else {
                bail!("raw output requires a single contiguous region");
            };
            writer.write_all(&region.to_bytes()).into_diagnostic()?;
        }
    }

    writer
        .flush()
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", path.display()))
}

fn save_output(data: &[u8], address: u32, file: Option<&Path>, format: FileFormat) -> Result<()> {
    let Some(path) = file else {
        hex_dump(data, address);
        return Ok(());
    };

    match format {
        FileFormat::Raw => fs::write(path, data)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write {}", path.display()))?,
        format => {
            let mut image = Image::new();
            image.insert(address, data)?;
            save_image(&image, path, format, hex::DEFAULT_RECORD_LENGTH)?;
        }
    }

    info!("Saved {} bytes to {}", data.len(), path.display());
    Ok(())
}

/// Print a 16-byte-wide hex dump with an ASCII gutter.
fn hex_dump(data: &[u8], base: u32) {
    for (i, row) in data.chunks(16).enumerate() {
        let address = base as u64 + (i * 16) as u64;

        let hex: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = row
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();

        println!("{address:08x}  {:<47}  |{ascii}|", hex.join(" "));
    }
}

/// Progress bar for multi-page flash writes
#[derive(Default)]
struct FlashProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_message(format!("{addr:#x}"));
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}
