// SPDX-License-Identifier: GPL-3.0-only

mod batch;
mod config;
mod logging;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use diskman_core::{Disk, Error as CoreError, Intent, Journal, Plan, TransactionOutcome};
use diskman_sys::{BlockDevice, FileDevice};
use diskman_types::partition_types::get_all_partition_type_infos;
use diskman_types::{Layout, SectorRange, TableFormat, parse_sectors};
use tracing::{debug, info};

use crate::batch::{Batch, DEFAULT_TYPE, partition_index, place};
use crate::config::Config;

/// Inspect and edit MBR and GPT partition tables
#[derive(Debug, Parser)]
#[command(name = "diskman")]
#[command(about = "Inspect and edit MBR and GPT partition tables", long_about = None)]
struct Cli {
    /// Config file to read instead of the per-user one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Staging journal to use instead of the configured location
    #[arg(long, value_name = "PATH")]
    journal: Option<PathBuf>,

    /// Logical sector size of an image file
    #[arg(long, value_name = "BYTES", value_parser = parse_sector_size)]
    sector_size: Option<u32>,

    /// More log output (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Block device or disk image
    device: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the partition table
    Show {
        #[arg(long)]
        json: bool,
        /// Include free space and reserved areas
        #[arg(long)]
        free: bool,
    },
    /// Write a new, empty partition table
    Init {
        /// gpt or dos; defaults to the configured format
        #[arg(value_parser = parse_format)]
        format: Option<TableFormat>,
        #[command(flatten)]
        commit: CommitArgs,
    },
    /// Add a partition
    Create {
        /// Sectors, or a size with a unit ("512M")
        size: String,
        /// First sector; the first aligned free region that fits when omitted
        #[arg(long)]
        start: Option<String>,
        /// Type name, dos type code or GPT type GUID
        #[arg(long = "type", default_value = DEFAULT_TYPE)]
        kind: String,
        /// Partition name (GPT only)
        #[arg(long, default_value = "")]
        label: String,
        #[command(flatten)]
        commit: CommitArgs,
    },
    /// Move the end of a partition
    Resize {
        /// Partition number as shown by `show`
        index: u32,
        /// New size in sectors, or with a unit
        size: String,
        #[command(flatten)]
        commit: CommitArgs,
    },
    /// Remove a partition
    Delete {
        /// Partition number as shown by `show`
        index: u32,
        #[command(flatten)]
        commit: CommitArgs,
    },
    /// Commit a TOML batch of steps as one change
    Apply {
        file: PathBuf,
        #[command(flatten)]
        commit: CommitArgs,
    },
    /// Copy a sector range to another place on the same disk
    Copy {
        from_start: u64,
        from_end: u64,
        to_start: u64,
    },
    /// Finish a table commit that was interrupted
    Recover,
    /// List the partition types known for a table format
    Types {
        /// Defaults to the format of the device's table
        #[arg(long, value_parser = parse_format)]
        format: Option<TableFormat>,
    },
}

#[derive(Debug, Args)]
struct CommitArgs {
    /// Print the plan without writing it
    #[arg(long)]
    dry_run: bool,
    /// Accept losing data in truncated partitions
    #[arg(long, short = 'y')]
    yes: bool,
    #[arg(long)]
    json: bool,
}

fn parse_format(s: &str) -> std::result::Result<TableFormat, String> {
    TableFormat::parse(s).ok_or_else(|| format!("unknown table format '{s}' (expected gpt or dos)"))
}

fn parse_sector_size(s: &str) -> std::result::Result<u32, String> {
    let size: u32 = s.parse().map_err(|e| format!("{e}"))?;
    if size < 512 || !size.is_power_of_two() {
        return Err(format!("{size} is not a power of two >= 512"));
    }
    Ok(size)
}

struct Session {
    device_path: PathBuf,
    name: String,
    config: Config,
    journal: Option<PathBuf>,
    sector_size: Option<u32>,
}

impl Session {
    fn open_device(&self, writable: bool) -> Result<Arc<dyn BlockDevice>> {
        let device = if writable {
            FileDevice::open_writable(&self.device_path)
        } else {
            FileDevice::open_read_only(&self.device_path)
        }
        .with_context(|| format!("opening {}", self.name))?;

        let device = match self.sector_size.or(self.config.sector_size) {
            Some(size) => device.with_sector_sizes(size, size),
            None => device,
        };
        Ok(Arc::new(device))
    }

    fn journal_path(&self) -> PathBuf {
        self.journal
            .clone()
            .unwrap_or_else(|| self.config.journal_path(&self.device_path))
    }

    /// The staging journal; read-only access never creates one
    fn open_journal(&self, writable: bool) -> Result<Journal> {
        let path = self.journal_path();
        if !writable && !path.exists() {
            return Ok(Journal::in_memory(&self.name));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating journal directory {}", parent.display()))?;
        }
        Journal::open_file(&path).with_context(|| format!("opening journal {}", path.display()))
    }

    fn open(&self, writable: bool) -> Result<Disk> {
        let device = self.open_device(writable)?;
        let journal = self.open_journal(writable)?;
        Disk::open(device, journal).with_context(|| format!("reading {}", self.name))
    }

    fn open_for_init(&self, writable: bool) -> Result<Disk> {
        let device = self.open_device(writable)?;
        let journal = self.open_journal(writable)?;
        Disk::open_for_init(device, journal).with_context(|| format!("reading {}", self.name))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config, config.log_level.louder(cli.verbose));
    debug!(?config, "loaded configuration");

    let session = Session {
        name: cli.device.display().to_string(),
        device_path: cli.device,
        config,
        journal: cli.journal,
        sector_size: cli.sector_size,
    };

    match cli.command {
        Command::Show { json, free } => show(&session, json, free),
        Command::Init { format, commit } => {
            let format = format.unwrap_or(session.config.default_format);
            init(&session, format, &commit)
        }
        Command::Create {
            size,
            start,
            kind,
            label,
            commit,
        } => {
            let mut disk = session.open(!commit.dry_run)?;
            let layout = disk.current_layout()?;
            let sector_size = layout.geometry().logical_sector_size;
            let size = parse_sectors(&size, sector_size)?;
            let start = match start {
                Some(start) => parse_sectors(&start, sector_size)?,
                None => place(layout, size, session.config.alignment_bytes)?,
            };
            let plan = disk.plan(&Intent::Create {
                start,
                size,
                kind,
                label,
            })?;
            commit_plan(&session, &mut disk, plan, &commit)
        }
        Command::Resize {
            index,
            size,
            commit,
        } => {
            let mut disk = session.open(!commit.dry_run)?;
            let sector_size = disk.geometry().logical_sector_size;
            let plan = disk.plan(&Intent::Resize {
                index: partition_index(index)?,
                new_size: parse_sectors(&size, sector_size)?,
            })?;
            commit_plan(&session, &mut disk, plan, &commit)
        }
        Command::Delete { index, commit } => {
            let mut disk = session.open(!commit.dry_run)?;
            let plan = disk.plan(&Intent::Delete {
                index: partition_index(index)?,
            })?;
            commit_plan(&session, &mut disk, plan, &commit)
        }
        Command::Apply { file, commit } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading batch {}", file.display()))?;
            let batch = Batch::parse(&text)
                .with_context(|| format!("parsing batch {}", file.display()))?;

            let mut disk = session.open(!commit.dry_run)?;
            let plan = batch.extend(disk.plan_all(&[])?, session.config.alignment_bytes)?;
            commit_plan(&session, &mut disk, plan, &commit)
        }
        Command::Copy {
            from_start,
            from_end,
            to_start,
        } => copy(&session, SectorRange::new(from_start, from_end), to_start),
        Command::Recover => recover(&session),
        Command::Types { format } => types(&session, format),
    }
}

fn show(session: &Session, json: bool, free: bool) -> Result<()> {
    let disk = session.open(false)?;
    let layout = disk.current_layout()?;

    if json {
        println!("{}", serde_json::to_string_pretty(layout)?);
        return Ok(());
    }

    if free {
        print!("{}", render::layout(&session.name, &empty_view(layout)));
        println!();
        print!(
            "{}",
            render::segments(&session.name, layout, session.config.alignment_bytes)
        );
    } else {
        print!("{}", render::layout(&session.name, layout));
    }
    Ok(())
}

/// The disk summary of `layout` without its partition rows
fn empty_view(layout: &Layout) -> Layout {
    Layout::empty(*layout.geometry(), *layout.label())
}

fn init(session: &Session, format: TableFormat, args: &CommitArgs) -> Result<()> {
    let mut disk = session.open_for_init(!args.dry_run)?;
    let plan = disk.initial_plan(format)?;
    print_plan(session, &plan, args)?;

    if args.dry_run {
        return Ok(());
    }
    if !plan.base().is_empty() && !args.yes {
        bail!(
            "{} holds {} partition(s); pass --yes to replace the table",
            session.name,
            plan.base().len()
        );
    }

    let outcome = disk.initialize(plan)?;
    report(session, outcome, args)
}

fn commit_plan(session: &Session, disk: &mut Disk, plan: Plan, args: &CommitArgs) -> Result<()> {
    let plan = if args.yes {
        plan.acknowledge_data_loss()
    } else {
        plan
    };
    print_plan(session, &plan, args)?;

    if args.dry_run {
        return Ok(());
    }
    if plan.is_empty() {
        return Ok(());
    }

    let outcome = disk.commit(plan)?;
    report(session, outcome, args)
}

fn print_plan(session: &Session, plan: &Plan, args: &CommitArgs) -> Result<()> {
    if args.json {
        if args.dry_run {
            println!("{}", serde_json::to_string_pretty(plan)?);
        }
    } else {
        print!("{}", render::plan(&session.name, plan));
    }
    Ok(())
}

fn report(session: &Session, outcome: TransactionOutcome, args: &CommitArgs) -> Result<()> {
    match outcome {
        TransactionOutcome::Applied { layout } => {
            info!(device = %session.name, partitions = layout.len(), "table committed");
            if args.json {
                println!("{}", serde_json::to_string_pretty(&layout)?);
            } else {
                println!("\nThe partition table has been altered.");
            }
            Ok(())
        }
        TransactionOutcome::Aborted {
            reason: reason @ CoreError::DataLossNotAcknowledged,
        } => Err(reason).context("nothing was written; pass --yes to accept the truncation"),
        TransactionOutcome::Aborted { reason } => {
            Err(reason).context("nothing was written")
        }
    }
}

fn copy(session: &Session, from: SectorRange, to_start: u64) -> Result<()> {
    let disk = session.open_for_init(true)?;
    let total = from.len() * u64::from(disk.geometry().logical_sector_size);

    let mut last_percent = 0;
    let copied = disk.copy_data(
        from,
        to_start,
        Some(|done: u64| {
            let percent = done * 100 / total.max(1);
            if percent >= last_percent + 10 {
                last_percent = percent;
                debug!(percent, "copying");
            }
        }),
    )?;

    println!("Copied {copied} bytes from sectors {from} to {to_start}.");
    Ok(())
}

fn recover(session: &Session) -> Result<()> {
    let path = session.journal_path();
    if !path.exists() {
        println!("No journal at {}; nothing to recover.", path.display());
        return Ok(());
    }

    let journal = Journal::open_file(&path)
        .with_context(|| format!("opening journal {}", path.display()))?;
    let staged = journal.pending()?;

    // Opening the device writable finishes a staged commit.
    let device = session.open_device(true)?;
    let mut disk = Disk::open_for_init(device, journal)?;
    let replayed_late = disk.recover()?;

    match staged {
        Some(staged) => println!(
            "Rewrote the table staged at sequence {} ({} bytes).",
            staged.sequence,
            staged.image.byte_len()
        ),
        None if replayed_late => println!("Rewrote a staged table."),
        None => println!("No interrupted commit; {} is consistent.", session.name),
    }

    if let Ok(layout) = disk.current_layout() {
        print!("\n{}", render::layout(&session.name, layout));
    }
    Ok(())
}

fn types(session: &Session, format: Option<TableFormat>) -> Result<()> {
    let format = match format {
        Some(format) => format,
        None => {
            let disk = session.open(false);
            disk.ok()
                .and_then(|disk| disk.format())
                .unwrap_or(session.config.default_format)
        }
    };

    let infos = get_all_partition_type_infos(format.as_str());
    let width = infos.iter().map(|i| i.ty.len()).max().unwrap_or(0);
    for info in infos {
        println!("{:<width$}  {}", info.ty, info.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn cli_parses_mutations_with_flags() {
        let cli = Cli::try_parse_from([
            "diskman", "-vv", "disk.img", "resize", "2", "1G", "--yes", "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Resize {
                index,
                size,
                commit,
            } => {
                assert_eq!(index, 2);
                assert_eq!(size, "1G");
                assert!(commit.yes && commit.dry_run && !commit.json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn create_defaults_to_linux() {
        let cli = Cli::try_parse_from(["diskman", "disk.img", "create", "512M"]).unwrap();
        match cli.command {
            Command::Create {
                kind, start, label, ..
            } => {
                assert_eq!(kind, "Linux");
                assert_eq!(start, None);
                assert!(label.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_formats_and_sector_sizes() {
        assert!(Cli::try_parse_from(["diskman", "d", "init", "apm"]).is_err());
        assert!(Cli::try_parse_from(["diskman", "--sector-size", "1000", "d", "show"]).is_err());

        let cli = Cli::try_parse_from(["diskman", "--sector-size", "4096", "d", "init", "mbr"])
            .unwrap();
        assert_eq!(cli.sector_size, Some(4096));
        assert!(matches!(
            cli.command,
            Command::Init {
                format: Some(TableFormat::Dos),
                ..
            }
        ));
    }

    fn session_for(dir: &Path, image: &Path) -> Session {
        let config = Config {
            journal_dir: Some(dir.join("journals")),
            ..Config::default()
        };
        Session {
            device_path: image.to_path_buf(),
            name: image.display().to_string(),
            config,
            journal: None,
            sector_size: None,
        }
    }

    #[test]
    fn init_create_and_show_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let file = std::fs::File::create(&image).unwrap();
        file.set_len(64 * 1024 * 1024).unwrap();
        drop(file);

        let session = session_for(dir.path(), &image);
        let args = CommitArgs {
            dry_run: false,
            yes: false,
            json: true,
        };
        init(&session, TableFormat::Gpt, &args).unwrap();

        let mut disk = session.open(true).unwrap();
        let layout = disk.current_layout().unwrap().clone();
        let start = place(&layout, 2048, session.config.alignment_bytes).unwrap();
        assert_eq!(start, 2048);
        let plan = disk
            .plan(&Intent::Create {
                start,
                size: 2048,
                kind: DEFAULT_TYPE.to_string(),
                label: "root".to_string(),
            })
            .unwrap();
        commit_plan(&session, &mut disk, plan, &args).unwrap();
        drop(disk);

        let disk = session.open(false).unwrap();
        let layout = disk.current_layout().unwrap();
        assert_eq!(layout.format(), TableFormat::Gpt);
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.partitions()[0].label, "root");
        assert!(render::layout(&session.name, layout).contains("Linux filesystem (root)"));
    }

    #[test]
    fn dry_run_leaves_the_image_alone() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let file = std::fs::File::create(&image).unwrap();
        file.set_len(16 * 1024 * 1024).unwrap();
        drop(file);

        let session = session_for(dir.path(), &image);
        let args = CommitArgs {
            dry_run: true,
            yes: false,
            json: true,
        };
        init(&session, TableFormat::Dos, &args).unwrap();

        assert!(session.open(false).is_err());
    }
}
