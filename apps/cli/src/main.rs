use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use da_core::patch::{build_extension, patch_first_stage, patch_second_stage};
use da_core::session::{DaSession, SessionConfig, wait_for_device};
use da_core::{
    LockFlag, NusbTransport, PartType, PartitionTable, SeccfgOutcome, Stage,
    StorageKind, TracingObserver, VbmetaFlags, extract_emi,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "MediaTek Download Agent Tool (Pure Rust)", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// DA loader file (MTK_AllInOne_DA.bin)
    #[arg(long, global = true)]
    loader: Option<String>,

    /// Directory scanned for DA loader files
    #[arg(long, global = true)]
    loader_dir: Option<String>,

    /// Preloader image carrying the DRAM config
    #[arg(long, global = true)]
    preloader: Option<String>,

    /// Storage kind: emmc, ufs, nand, nor
    #[arg(long, global = true)]
    storage: Option<String>,

    /// Upload the DA without patching it
    #[arg(long, global = true)]
    no_patch: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List DA loader images
    Loaders,
    /// Show the loader chosen for a chip
    Select {
        #[arg(long, value_parser = parse_u16)]
        hwcode: u16,
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        hwver: u16,
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        swver: u16,
    },
    /// Patch both DA stages offline
    Patch {
        #[arg(long, value_parser = parse_u16)]
        hwcode: u16,
        #[arg(long, value_parser = parse_u16, default_value = "0xFFFF")]
        hwver: u16,
        #[arg(long, value_parser = parse_u16, default_value = "0xFFFF")]
        swver: u16,
        /// Extension template to resolve against the second stage
        #[arg(long)]
        extension: Option<PathBuf>,
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        efuse_base: u32,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Extract the EMI (DRAM config) from a preloader image
    Emi {
        preloader: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Use the V6 layout
        #[arg(long)]
        v6: bool,
    },
    /// Print a partition table stored in a file
    GptFile {
        file: PathBuf,
        #[arg(long, default_value = "512")]
        page_size: u32,
    },
    /// Print the device partition table
    Printgpt {
        #[arg(long, default_value = "user")]
        part: String,
        /// Also save the raw table window
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Read partitions into a directory
    R {
        /// Comma-separated partition names
        partitions: String,
        #[arg(default_value = ".")]
        out: PathBuf,
    },
    /// Write files to partitions
    W {
        /// Comma-separated partition names
        partitions: String,
        /// Comma-separated files, one per partition
        files: String,
    },
    /// Erase partitions
    E {
        /// Comma-separated partition names
        partitions: String,
        /// Only zero this many sectors of each partition
        #[arg(long)]
        sectors: Option<u64>,
    },
    /// RPMB access
    Rpmb {
        #[command(subcommand)]
        action: RpmbAction,
    },
    /// Change the seccfg lock state
    Seccfg {
        #[command(subcommand)]
        flag: SeccfgAction,
    },
    /// Patch the vbmeta flags (0 enable all, 1 verity off, 2 verification off, 3 both off)
    Vbmeta {
        #[arg(value_parser = parse_u32)]
        mode: u32,
    },
    /// Derive the device key set
    Keys {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Read memory words
    Peek {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32, default_value = "1")]
        dwords: u32,
    },
}

#[derive(Subcommand, Debug)]
enum RpmbAction {
    /// Read sectors into a file
    R {
        out: PathBuf,
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        sector: u32,
        /// 0 reads the whole RPMB
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        count: u32,
    },
    /// Write a file to sectors
    W {
        file: PathBuf,
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        sector: u32,
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        count: u32,
    },
    /// Zero sectors
    E {
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        sector: u32,
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        count: u32,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum SeccfgAction {
    Lock,
    Unlock,
}

impl From<SeccfgAction> for LockFlag {
    fn from(action: SeccfgAction) -> Self {
        match action {
            SeccfgAction::Lock => LockFlag::Lock,
            SeccfgAction::Unlock => LockFlag::Unlock,
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_u32(s)?;
    u16::try_from(value).map_err(|_| format!("'{s}' does not fit in 16 bits"))
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if args.loader.is_some() {
        config.loader_path = args.loader.clone();
    }
    if args.loader_dir.is_some() {
        config.loader_dir = args.loader_dir.clone();
    }
    if args.preloader.is_some() {
        config.preloader_path = args.preloader.clone();
    }
    if let Some(storage) = &args.storage {
        config.storage = Some(storage.parse::<StorageKind>()?);
    }
    if args.no_patch {
        config.patch = false;
    }
    Ok(config)
}

/// Wait for the device and bring the DA up.
fn connect(config: SessionConfig) -> Result<DaSession<NusbTransport, TracingObserver>> {
    let transport = wait_for_device(config.retry_timeout_secs)?;
    let mut session = DaSession::new(transport, config)?;
    session.identify()?;
    session.select_loader()?;
    let stages = session.patch_images()?;
    session.upload(&stages)?;
    Ok(session)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    match args.command {
        Command::Loaders => {
            let repository = config.repository()?;
            if repository.is_empty() {
                warn!("No DA loaders found, pass --loader or --loader-dir");
            }
            for image in repository.iter() {
                println!("{image}  {}", image.path.display());
            }
        }
        Command::Select {
            hwcode,
            hwver,
            swver,
        } => {
            let repository = config.repository()?;
            match repository.select(hwcode, hwver, swver) {
                Some(image) => println!("{image}  {}", image.path.display()),
                None => bail!("No DA loader for hw code 0x{hwcode:04X}"),
            }
        }
        Command::Patch {
            hwcode,
            hwver,
            swver,
            extension,
            efuse_base,
            out,
        } => {
            let repository = config.repository()?;
            let image = repository
                .select(hwcode, hwver, swver)
                .ok_or_else(|| anyhow!("No DA loader for hw code 0x{hwcode:04X}"))?;
            let first = image.read_stage(Stage::First)?;
            let second = image.read_stage(Stage::Second)?;

            let (da1, report) = patch_first_stage(first.payload());
            println!("DA1:\n{report}");
            let (da2, report) = patch_second_stage(second.payload(), second.load_address);
            println!("DA2:\n{report}");
            std::fs::create_dir_all(&out)?;
            std::fs::write(out.join("da1.patched.bin"), &da1)?;
            std::fs::write(out.join("da2.patched.bin"), &da2)?;

            if let Some(path) = extension {
                let template = std::fs::read(&path)?;
                let blob = build_extension(&template, &da2, second.load_address, efuse_base)
                    .ok_or_else(|| anyhow!("{} is not an extension template", path.display()))?;
                println!("Extension symbols:\n{}", blob.symbols);
                std::fs::write(out.join("da_x.bin"), &blob.data)?;
            }
            info!(dir = %out.display(), "Patched stages written");
        }
        Command::Emi { preloader, out, v6 } => {
            let data = std::fs::read(&preloader)?;
            let emi = extract_emi(&data, !v6)
                .ok_or_else(|| anyhow!("No EMI data in {}", preloader.display()))?;
            println!("EMI version 0x{:X}, {} bytes", emi.version, emi.data.len());
            if let Some(out) = out {
                std::fs::write(&out, &emi.data)?;
                info!(path = %out.display(), "EMI written");
            }
        }
        Command::GptFile { file, page_size } => {
            let data = std::fs::read(&file)?;
            let table = PartitionTable::parse_with_page_size(&data, None, page_size)?;
            print!("{table}");
        }
        Command::Printgpt { part, out } => {
            let part = part.parse::<PartType>()?;
            let mut session = connect(config)?;
            if let Some(out) = out {
                std::fs::write(&out, session.dump_gpt(part)?)?;
                info!(path = %out.display(), "Table window saved");
            }
            print!("{}", session.partition_table(part)?);
        }
        Command::R { partitions, out } => {
            std::fs::create_dir_all(&out)?;
            let mut session = connect(config)?;
            let report = session.read_partitions(&split_list(&partitions), &out)?;
            println!("{report}");
            if !report.is_success() {
                bail!("Some partitions could not be read");
            }
        }
        Command::W { partitions, files } => {
            let names = split_list(&partitions);
            let files = split_list(&files);
            if names.len() != files.len() {
                bail!("{} partitions but {} files", names.len(), files.len());
            }
            let items: Vec<(String, PathBuf)> =
                names.into_iter().zip(files.into_iter().map(PathBuf::from)).collect();
            let mut session = connect(config)?;
            let report = session.write_partitions(&items)?;
            println!("{report}");
            if !report.is_success() {
                bail!("Some partitions could not be written");
            }
        }
        Command::E {
            partitions,
            sectors,
        } => {
            let names = split_list(&partitions);
            let mut session = connect(config)?;
            let report = match sectors {
                Some(sectors) => {
                    let items: Vec<(String, u64)> = names.into_iter().map(|n| (n, sectors)).collect();
                    session.erase_sectors(&items)?
                }
                None => session.erase_partitions(&names)?,
            };
            println!("{report}");
            if !report.is_success() {
                bail!("Some partitions could not be erased");
            }
        }
        Command::Rpmb { action } => {
            let mut session = connect(config)?;
            match action {
                RpmbAction::R { out, sector, count } => {
                    let data = session.rpmb_read(sector, count)?;
                    std::fs::write(&out, &data)?;
                    info!(path = %out.display(), bytes = data.len(), "RPMB dumped");
                }
                RpmbAction::W {
                    file,
                    sector,
                    count,
                } => {
                    let data = std::fs::read(&file)?;
                    session.rpmb_write(sector, count, &data)?;
                    info!(path = %file.display(), "RPMB written");
                }
                RpmbAction::E { sector, count } => {
                    session.rpmb_erase(sector, count)?;
                    info!("RPMB erased");
                }
            }
        }
        Command::Seccfg { flag } => {
            let mut session = connect(config)?;
            match session.seccfg_toggle(flag.into())? {
                SeccfgOutcome::Rewritten { state, .. } => println!("Device is now {state}"),
                SeccfgOutcome::Unchanged(reason) => println!("{reason}"),
            }
        }
        Command::Vbmeta { mode } => {
            let flags = VbmetaFlags::from_mode(mode)?;
            let mut session = connect(config)?;
            let name = session.patch_vbmeta(flags)?;
            println!("Patched {name}");
        }
        Command::Keys { out } => {
            let mut session = connect(config)?;
            let keys = session.generate_keys()?;
            print!("{keys}");
            if let Some(out) = out {
                keys.save_to_file(&out)?;
                info!(path = %out.display(), "Keys saved");
            }
        }
        Command::Peek { address, dwords } => {
            let mut session = connect(config)?;
            for (i, word) in session.peek(address, dwords as usize)?.iter().enumerate() {
                println!("0x{:08X}: 0x{word:08X}", address + i as u32 * 4);
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting mtkda (nusb backend)...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u32("0x766"), Ok(0x766));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u16("0x10000").is_err());
        assert!(parse_u32("zz").is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("boot, vbmeta,,"), vec!["boot", "vbmeta"]);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["mtkda", "--no-patch", "rpmb", "r", "out.bin", "--count", "0x10"])
            .unwrap();
        assert!(args.no_patch);
        assert!(matches!(
            args.command,
            Command::Rpmb {
                action: RpmbAction::R { count: 16, .. }
            }
        ));
        let config = load_config(&args).unwrap();
        assert!(!config.patch);
    }
}
