// SPDX-License-Identifier: LGPL-2.1-or-later
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    reason = "Docs here are not used by rustdoc, they are used by clap for CLI help"
)]

use std::fs;
use std::path::PathBuf;

mod parsers;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use fwcore::firmware::tpm_eventlog::calc_checksums;
use fwcore::firmware::{ChecksumKind, Firmware, ParseFlags};
use fwcore::formatters::BinaryBytesOne;
use fwcore::plugin::{firmware_formats, firmware_from_format};
use fwcore::progress::Progress;
use fwcore::stream::InputStream;
use indicatif::{ProgressBar, ProgressStyle};
use log::{LevelFilter, debug};
use pretty_hex::{HexConfig, PrettyHex};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::builder()
        .filter_level(match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .parse_default_env()
        .init();
    args.run()
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Verbosity level, use more for more verbosity
    ///
    /// -v means info, -vv means debug and -vvv and more is trace level. If RUST_LOG environment
    /// variable is set, it overrides this option. For more documentation about it, refer to
    /// env_logger crate.
    #[arg(short, long, action = clap::ArgAction::Count, default_value_t = 0)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a firmware container and print its structure.
    FirmwareParse {
        /// Firmware file to load
        file: PathBuf,
        /// Container format, autodetected when omitted
        ///
        /// Available formats: raw, archive, ihex, hailuck-kbd, uf2,
        /// tpm-eventlog-v1, tpm-eventlog-v2, acpi-phat, amd-psp, amd-atom,
        /// usb4-nvm, dock
        #[arg(long, short)]
        format: Option<String>,
        /// Accept minor format violations
        #[arg(long)]
        force: bool,
        /// Skip integrity checks
        #[arg(long)]
        ignore_checksum: bool,
        /// Also dump the payload bytes
        #[arg(long, short = 'x')]
        hexdump: bool,
    },
    /// Export a parsed firmware as JSON, e.g. for golden-file tests.
    FirmwareExport {
        /// Firmware file to load
        file: PathBuf,
        /// Container format, autodetected when omitted
        #[arg(long, short)]
        format: Option<String>,
        /// Strip offsets, sizes and flags for stable comparisons
        #[arg(long)]
        report: bool,
    },
    /// Rebuild a payload into another container format.
    ///
    /// The input is parsed, its payload extracted, and a fresh container of
    /// the output format written, e.g. a raw binary into a UF2 image.
    FirmwareConvert {
        /// Input firmware file
        input: PathBuf,
        /// Output firmware file
        output: PathBuf,
        /// Input container format, autodetected when omitted
        #[arg(long)]
        input_format: Option<String>,
        /// Output container format
        #[arg(long)]
        output_format: String,
        /// Base address for formats that carry one
        #[arg(long, value_parser = parsers::parse_number::<u64>, default_value_t = 0)]
        addr: u64,
        /// Family or section tag for formats that carry one
        #[arg(long, value_parser = parsers::parse_number::<u64>, default_value_t = 0)]
        idx: u64,
        /// Version string to embed
        #[arg(long)]
        fw_version: Option<String>,
    },
    /// Compute the possible PCR values from a TPM event log.
    TpmPcrs {
        /// Event log file, e.g. a copy of binary_bios_measurements
        file: PathBuf,
        /// PCR register to fold
        #[arg(value_parser = parsers::parse_number::<u8>, default_value_t = 0)]
        pcr: u8,
        /// Parse as the TPM 1.2 fixed-digest layout instead of crypto-agile
        #[arg(long)]
        v1: bool,
    },
    /// Print the payload digest of a firmware container.
    Checksum {
        /// Firmware file to load
        file: PathBuf,
        /// Container format, autodetected when omitted
        #[arg(long, short)]
        format: Option<String>,
    },
}

impl Args {
    fn run(self) -> anyhow::Result<()> {
        match self.command {
            Commands::FirmwareParse {
                file,
                format,
                force,
                ignore_checksum,
                hexdump,
            } => {
                let mut flags = ParseFlags::empty();
                if force {
                    flags |= ParseFlags::FORCE;
                }
                if ignore_checksum {
                    flags |= ParseFlags::IGNORE_CHECKSUM;
                }
                let firmware = load_firmware(&file, format.as_deref(), flags)?;
                println!("{}", serde_json::to_string_pretty(&firmware.export())?);
                println!(
                    "Loaded {} image of {}",
                    firmware.kind(),
                    BinaryBytesOne(firmware.size())
                );
                if hexdump && let Ok(bytes) = firmware.bytes() {
                    let cfg = HexConfig {
                        title: false,
                        group: 8,
                        width: 16,
                        ascii: true,
                        ..HexConfig::default()
                    };
                    println!("{:?}", bytes.hex_conf(cfg));
                }
            }
            Commands::FirmwareExport { file, format, report } => {
                let firmware = load_firmware(&file, format.as_deref(), ParseFlags::empty())?;
                let node = if report {
                    firmware.export_report()
                } else {
                    firmware.export()
                };
                println!("{}", serde_json::to_string_pretty(&node)?);
            }
            Commands::FirmwareConvert {
                input,
                output,
                input_format,
                output_format,
                addr,
                idx,
                fw_version,
            } => {
                let parsed = load_firmware(&input, input_format.as_deref(), ParseFlags::empty())?;
                let mut target = firmware_from_format(&output_format)
                    .with_context(|| format!("unknown output format {output_format}"))?;
                target.set_bytes(parsed.bytes()?.to_vec());
                target.set_addr(addr);
                target.set_idx(idx);
                if let Some(version) = fw_version.as_deref() {
                    target.set_version(version);
                }
                let blob = target.write()?;

                let bar = ProgressBar::new(100);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{prefix} [{bar:40}] {binary_bytes:>}/{binary_total_bytes}",
                    )
                    .unwrap()
                    .progress_chars("##-"),
                );
                bar.set_prefix("Writing");
                let mut progress = Progress::new();
                let bar_sink = bar.clone();
                progress.set_sink(Box::new(move |percentage, _status| {
                    bar_sink.set_position(u64::from(percentage));
                }));
                fwcore::transport::block::set_contents(
                    &output,
                    &InputStream::from_vec(blob),
                    Some(&mut progress),
                )?;
                bar.finish();
                println!("Converted {} to {output_format}", input.display());
            }
            Commands::TpmPcrs { file, pcr, v1 } => {
                let format_id = if v1 { "tpm-eventlog-v1" } else { "tpm-eventlog-v2" };
                let firmware = load_firmware(&file, Some(format_id), ParseFlags::empty())?;
                for checksum in calc_checksums(&firmware, pcr)? {
                    println!("PCR{pcr}: {checksum}");
                }
            }
            Commands::Checksum { file, format } => {
                let firmware = load_firmware(&file, format.as_deref(), ParseFlags::empty())?;
                println!("sha1:   {}", firmware.checksum(ChecksumKind::Sha1)?);
                println!("sha256: {}", firmware.checksum(ChecksumKind::Sha256)?);
            }
        }
        Ok(())
    }
}

/// Load a container, autodetecting the format when none was given
fn load_firmware(
    file: &PathBuf,
    format: Option<&str>,
    flags: ParseFlags,
) -> anyhow::Result<Firmware> {
    let data = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let stream = InputStream::from_vec(data);
    if let Some(format_id) = format {
        let mut firmware = firmware_from_format(format_id)
            .with_context(|| format!("unknown format {format_id}"))?;
        firmware
            .parse(&stream, flags)
            .with_context(|| format!("failed to parse as {format_id}"))?;
        return Ok(firmware);
    }
    for format_id in firmware_formats() {
        if *format_id == "raw" {
            continue;
        }
        let Some(mut firmware) = firmware_from_format(format_id) else {
            continue;
        };
        if firmware
            .base()
            .flags()
            .contains(fwcore::firmware::FirmwareFlags::NO_AUTO_DETECTION)
        {
            continue;
        }
        if firmware.validate(&stream, 0).is_err() {
            continue;
        }
        debug!("detected {format_id}");
        match firmware.parse(&stream, flags) {
            Ok(()) => return Ok(firmware),
            Err(err) => debug!("parsing as {format_id} failed: {err}"),
        }
    }
    bail!("no parser recognised {}", file.display());
}
