//! A library and application for programming Texas Instruments CC253x/CC254x
//! devices over the two-wire CC debug interface
//!
//! ## As an application
//!
//! [ccflash] can be installed using `cargo install`:
//!
//! ```bash
//! $ cargo install ccflash
//! ```
//!
//! Talking to a chip requires a host with GPIO lines for the RESET, DC and DD
//! pins. On a Raspberry Pi this is provided by the `raspberry` feature, which
//! depends on the [rppal] package and will not build on most other systems:
//!
//! ```bash
//! $ cargo install ccflash --features=raspberry
//! ```
//!
//! Image conversion (`ccflash convert`) works on any host, no hardware
//! required.
//!
//! ## As a library
//!
//! ```toml
//! ccflash = { version = "0.3", default-features = false }
//! ```
//!
//! We add `default-features` here to disable the `cli` feature, which is
//! enabled by default. Note that the `cli` module does not provide SemVer
//! guarantees. To drive a chip from your own application, implement
//! [`PinPort`](port::PinPort) for whatever drives your GPIO lines and hand it
//! to [`Flasher::connect`](flasher::Flasher::connect).
//!
//! [ccflash]: https://crates.io/crates/ccflash
//! [rppal]: https://docs.rs/rppal/latest/rppal/

#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod image;
#[cfg(feature = "raspberry")]
#[cfg_attr(docsrs, doc(cfg(feature = "raspberry")))]
pub mod interface;
pub mod port;
pub mod progress;
pub mod targets;

pub use crate::error::Error;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
