use ccflash::{
    cli::{self, config::Config, ConnectArgs},
    logging::initialize_logger,
};
use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;

/// Main CLI parser.
#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print information about a connected chip
    ///
    /// Resets the chip into debug mode and prints its type, revision, debug
    /// lock state, memory geometry and IEEE address.
    BoardInfo(ConnectArgs),
    /// Issue a raw debug command and print the status word
    Command(cli::ExecCommandArgs),
    /// Execute a CPU instruction and print the resulting accumulator
    Exec(cli::ExecInstructionArgs),
    /// Read a range of XDATA memory
    ReadMemory(cli::ReadArgs),
    /// Write to XDATA memory
    WriteMemory(cli::WriteArgs),
    /// Read a range of flash memory
    ReadFlash(cli::ReadArgs),
    /// Write an image to flash
    ///
    /// Accepts Intel-hex files, binary envelopes, raw files with an explicit
    /// address, or inline hex data. Pages are unlocked and erased as needed,
    /// and partially covered pages are read, spliced and written back.
    WriteFlash(cli::WriteArgs),
    /// Read one flash page
    ReadPage(cli::ReadPageArgs),
    /// Write one flash page
    WritePage(cli::WritePageArgs),
    /// Erase one flash page
    ErasePage(cli::PageArgs),
    /// Query the lock state of one flash page
    PageLocked(cli::PageArgs),
    /// Lock a range of flash pages
    LockPages(cli::LockPagesArgs),
    /// Unlock a range of flash pages
    UnlockPages(cli::LockPagesArgs),
    /// Erase the entire flash
    ///
    /// This is the only operation (besides board-info) available on a
    /// debug-locked chip; the erase clears the lock together with the flash
    /// contents.
    EraseFlash(ConnectArgs),
    /// Permanently lock the debug interface
    ///
    /// Clears the lock bit in the last byte of flash. From the next reset on
    /// the chip only answers identification and chip-erase requests; only a
    /// full chip erase lifts the lock again.
    LockDebug(ConnectArgs),
    /// Convert between Intel-hex, binary envelope and raw image files
    ///
    /// Works without any hardware attached.
    Convert(cli::ConvertArgs),
    /// Store the GPIO wiring in the configuration file
    SetPins(cli::SetPinsArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();
    let args = cli.subcommand;
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match args {
        Commands::BoardInfo(args) => cli::board_info(&args, &config),
        Commands::Command(args) => cli::exec_command(&args, &config),
        Commands::Exec(args) => cli::exec_instruction(&args, &config),
        Commands::ReadMemory(args) => cli::read_memory(&args, &config),
        Commands::WriteMemory(args) => cli::write_memory(&args, &config),
        Commands::ReadFlash(args) => cli::read_flash(&args, &config),
        Commands::WriteFlash(args) => cli::write_flash(&args, &config),
        Commands::ReadPage(args) => cli::read_page(&args, &config),
        Commands::WritePage(args) => cli::write_page(&args, &config),
        Commands::ErasePage(args) => cli::erase_page(&args, &config),
        Commands::PageLocked(args) => cli::page_locked(&args, &config),
        Commands::LockPages(args) => cli::lock_pages(&args, &config),
        Commands::UnlockPages(args) => cli::unlock_pages(&args, &config),
        Commands::EraseFlash(args) => cli::erase_flash(&args, &config),
        Commands::LockDebug(args) => cli::lock_debug(&args, &config),
        Commands::Convert(args) => cli::convert(&args),
        Commands::SetPins(args) => cli::set_pins(&args, &config),
    }
}
