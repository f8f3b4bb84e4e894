// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use portal_store::{
    store::{workspace::WorkspaceError, BoxError},
    CommitMessage, ManifestName, Store, StoreSettings,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use git2::Oid;
use std::{
    fs::read_to_string,
    io::{read_to_string as read_all, stdin},
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "portal-store [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Load settings from TOML file instead of environment.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let settings = load_settings(self.config)?;
        match self.command {
            Command::Sync(opts) => run_sync(&settings, opts),
            Command::Status => run_status(&settings),
            Command::List => run_list(&settings),
            Command::Show(opts) => run_show(&settings, opts),
            Command::Create(opts) => run_create(&settings, opts),
            Command::Update(opts) => run_update(&settings, opts),
            Command::Delete(opts) => run_delete(&settings, opts),
            Command::Config => run_config(&settings),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Clone or synchronize working copy with remote.
    #[command(override_usage = "portal-store sync [options]")]
    Sync(SyncOptions),

    /// Show health of working copy.
    #[command(override_usage = "portal-store status [options]")]
    Status,

    /// List stored VM names.
    #[command(override_usage = "portal-store list [options]")]
    List,

    /// Print manifest of VM.
    #[command(override_usage = "portal-store show [options] <vm_name>")]
    Show(ShowOptions),

    /// Store manifest of new VM.
    #[command(override_usage = "portal-store create [options] <vm_name> <file>")]
    Create(WriteOptions),

    /// Replace manifest of existing VM.
    #[command(override_usage = "portal-store update [options] <vm_name> <file>")]
    Update(WriteOptions),

    /// Remove manifest of VM.
    #[command(override_usage = "portal-store delete [options] <vm_name>")]
    Delete(ShowOptions),

    /// Print effective settings, without token.
    #[command(override_usage = "portal-store config [options]")]
    Config,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncOptions {
    /// Also push local commits left behind by a failed push.
    #[arg(short, long)]
    pub push: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ShowOptions {
    /// Name of target VM.
    #[arg(required = true, value_name = "vm_name")]
    pub vm_name: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct WriteOptions {
    /// Name of target VM.
    #[arg(required = true, value_name = "vm_name")]
    pub vm_name: String,

    /// Rendered manifest to store, "-" reads standard input.
    #[arg(required = true, value_name = "file")]
    pub file: PathBuf,
}

fn main() {
    dotenvy::dotenv().ok();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn load_settings(config: Option<PathBuf>) -> Result<StoreSettings> {
    match config {
        Some(path) => {
            let data = read_to_string(&path)
                .with_context(|| format!("failed to read settings {:?}", path.display()))?;
            Ok(data.parse::<StoreSettings>()?)
        }
        None => Ok(StoreSettings::from_env()?),
    }
}

fn subdirectory(settings: &StoreSettings) -> Option<&str> {
    Some(settings.storage.subdirectory.as_str()).filter(|subdir| !subdir.is_empty())
}

fn read_manifest_input(file: &Path) -> Result<String> {
    if file.as_os_str() == "-" {
        return read_all(stdin()).context("failed to read manifest from standard input");
    }

    read_to_string(file).with_context(|| format!("failed to read manifest {:?}", file.display()))
}

fn run_sync(settings: &StoreSettings, opts: SyncOptions) -> Result<()> {
    let store = Store::from_settings(settings);
    let path = store.ensure()?;
    if opts.push {
        let pushed = store.reconcile()?;
        info!("pushed {pushed} pending commits");
    }
    println!("{}", path.display());

    Ok(())
}

fn run_status(settings: &StoreSettings) -> Result<()> {
    let store = Store::from_settings(settings);
    let report = store.status();
    print!("{}", toml::ser::to_string_pretty(&report)?);

    match report.error {
        Some(error) => Err(anyhow!(error)),
        None => Ok(()),
    }
}

fn run_list(settings: &StoreSettings) -> Result<()> {
    let store = Store::from_settings(settings);
    let names = store.list_manifests(subdirectory(settings), Some(".yaml"))?;
    for name in names.iter().filter_map(ManifestName::from_file_name) {
        println!("{name}");
    }

    Ok(())
}

fn run_show(settings: &StoreSettings, opts: ShowOptions) -> Result<()> {
    let name = ManifestName::new(opts.vm_name)?;
    let store = Store::from_settings(settings);
    print!(
        "{}",
        store.read_manifest(&name.file_name(), subdirectory(settings))?
    );

    Ok(())
}

fn run_create(settings: &StoreSettings, opts: WriteOptions) -> Result<()> {
    let name = ManifestName::new(opts.vm_name)?;
    let content = read_manifest_input(&opts.file)?;
    let subdir = subdirectory(settings);
    let store = Store::from_settings(settings);

    let commit = store.transaction(
        &format!("create {name}"),
        |workspace| -> Result<Oid, BoxError> {
            if workspace.read_manifest(&name.file_name(), subdir).is_ok() {
                return Err(format!("VM {name} already exists").into());
            }

            Ok(workspace.write_manifest(
                &name.file_name(),
                &content,
                &CommitMessage::Create.render(&name),
                subdir,
            )?)
        },
    )?;
    info!("created {name} at {commit}");

    Ok(())
}

fn run_update(settings: &StoreSettings, opts: WriteOptions) -> Result<()> {
    let name = ManifestName::new(opts.vm_name)?;
    let content = read_manifest_input(&opts.file)?;
    let subdir = subdirectory(settings);
    let store = Store::from_settings(settings);

    let commit = store.transaction(
        &format!("update {name}"),
        |workspace| -> Result<Oid, WorkspaceError> {
            // INVARIANT: Only existing VMs can be updated.
            workspace.read_manifest(&name.file_name(), subdir)?;
            workspace.write_manifest(
                &name.file_name(),
                &content,
                &CommitMessage::Update.render(&name),
                subdir,
            )
        },
    )?;
    info!("updated {name} at {commit}");

    Ok(())
}

fn run_delete(settings: &StoreSettings, opts: ShowOptions) -> Result<()> {
    let name = ManifestName::new(opts.vm_name)?;
    let store = Store::from_settings(settings);
    let commit = store.delete_manifest(
        &name.file_name(),
        &CommitMessage::Delete.render(&name),
        subdirectory(settings),
    )?;
    info!("deleted {name} at {commit}");

    Ok(())
}

fn run_config(settings: &StoreSettings) -> Result<()> {
    print!("{settings}");
    Ok(())
}
