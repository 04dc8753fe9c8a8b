use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, info_span, Level};
use tvix_vfs::delegate::{DelegateFs, HostFs};
use tvix_vfs::{recordstore, Error, PersistentFs, TreeEntry, VfsConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long)]
    log_level: Option<Level>,

    /// The directory mirrored into the record store.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long, env = "TVIX_VFS_RECORD_STORE_ADDR", default_value = "memory://")]
    record_store_addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the children of a directory
    Ls {
        #[clap(value_name = "PATH", default_value = "")]
        path: String,

        #[arg(long, short = 'r')]
        recursive: bool,
    },
    /// Prints the content of a file
    Cat {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Prints the persisted attributes of a file
    Stat {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Compares the persisted tree with the disk and applies the differences
    Refresh {
        #[clap(value_name = "PATH", default_value = "")]
        path: String,

        #[arg(long, short = 'r')]
        recursive: bool,
    },
}

/// Walks `path`, relative to `root`.
fn lookup(vfs: &PersistentFs, root: &Arc<TreeEntry>, path: &str) -> Result<Arc<TreeEntry>, Error> {
    let mut current = root.clone();
    for name in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        current = vfs
            .find_child(&current, name)?
            .ok_or_else(|| Error::NotFound(format!("{} does not exist", path)))?;
    }
    Ok(current)
}

fn print_tree(
    vfs: &PersistentFs,
    dir: &Arc<TreeEntry>,
    prefix: &str,
    recursive: bool,
    out: &mut impl Write,
) -> Result<(), Error> {
    for child in vfs.children(dir)? {
        let name = if prefix.is_empty() {
            child.name()
        } else {
            format!("{}/{}", prefix, child.name())
        };
        if child.is_directory() {
            writeln!(out, "{}/", name)?;
            if recursive {
                print_tree(vfs, &child, &name, recursive, out)?;
            }
        } else {
            writeln!(out, "{}", name)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let tracing_handle = tvix_tracing::TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .enable_progressbar()
        .build()?;

    let store = recordstore::from_addr(&cli.record_store_addr)?;
    let vfs = PersistentFs::new(store, VfsConfig::default())?;

    let root_path = cli.root.canonicalize()?;
    let fs: Arc<dyn DelegateFs> = Arc::new(HostFs::default());
    let root = vfs.find_root(&root_path.to_string_lossy(), fs)?;
    info!(path = %root_path.display(), root.id = %root.id(), "mirroring");

    let mut out = tracing_handle.stdout();
    match cli.command {
        Commands::Ls { path, recursive } => {
            let dir = lookup(&vfs, &root, &path)?;
            print_tree(&vfs, &dir, "", recursive, &mut out)?;
        }
        Commands::Cat { path } => {
            let file = lookup(&vfs, &root, &path)?;
            io::copy(&mut vfs.input_stream(&file)?, &mut out)?;
        }
        Commands::Stat { path } => {
            let file = lookup(&vfs, &root, &path)?;
            writeln!(out, "id:        {}", file.id())?;
            writeln!(out, "path:      {}", vfs.path(&file)?)?;
            writeln!(out, "directory: {}", file.is_directory())?;
            writeln!(out, "writable:  {}", vfs.is_writable(&file)?)?;
            writeln!(out, "hidden:    {}", vfs.is_hidden(&file)?)?;
            writeln!(out, "symlink:   {}", vfs.is_symlink(&file)?)?;
            writeln!(out, "timestamp: {}", vfs.timestamp(&file)?)?;
            if !file.is_directory() {
                writeln!(out, "length:    {}", vfs.length(&file)?)?;
            }
            writeln!(out, "flags:     {:?}", vfs.file_flags(file.id())?)?;
            writeln!(out, "mod count: {}", vfs.modification_count(&file)?)?;
        }
        Commands::Refresh { path, recursive } => {
            let dir = lookup(&vfs, &root, &path)?;
            let _span = info_span!("refresh", indicatif.pb_show = 1).entered();
            vfs.list(&dir)?;
            vfs.refresh(&dir, recursive)?;
            info!(
                mod_count = vfs.filesystem_modification_count()?,
                "refresh completed"
            );
        }
    }
    out.flush()?;

    vfs.dispose()?;
    Ok(())
}
