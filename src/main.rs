use clap::{Parser, Subcommand};
use casc_forge::archive_index::ArchiveIndex;
use casc_forge::blte::{self, BlteReader, ChunkSpec};
use casc_forge::config::ContainerSettings;
use casc_forge::identity::{IdentityCache, JsonIdentityCache, MemoryIdentityCache};
use casc_forge::remote::{Fetcher, MirrorFetcher};
use casc_forge::writer::{CdnLayout, WriteMode};
use casc_forge::{Container, LocaleFlags};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "casc-forge", about = "Read and write CASC storage")]
struct Cli {
    /// More output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ContainerArgs {
    /// JSON settings file; the flags below override it
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Installed client directory (holds .build.info and Data/)
    #[arg(short, long)]
    base: Option<PathBuf>,
    /// Output directory for CDN files and the new .build.info
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Locale to search and edit, e.g. enUS
    #[arg(long)]
    locale: Option<String>,
    /// Lowest id handed to new files
    #[arg(long)]
    min_id: Option<u32>,
    /// CDN host, repeatable
    #[arg(long = "host")]
    hosts: Vec<String>,
    /// Serve host URLs from this directory instead of the network
    #[arg(long)]
    mirror: Option<PathBuf>,
    /// Write loose objects as xx/yy/key instead of flat
    #[arg(long)]
    sharded: bool,
    /// Also append new objects to the local data.NNN archives
    #[arg(long)]
    archive: bool,
    /// JSON identity cache file
    #[arg(long)]
    cache: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// BLTE-encode a file
    Encode {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// zlib level; 0 stores chunks verbatim
        #[arg(short, long, default_value = "9")]
        level: i32,
        /// Chunk size in KiB, 0 for a single chunk
        #[arg(long, default_value = "256")]
        chunk_size: usize,
    },
    /// Decode a BLTE file
    Decode {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List the entries of a CDN archive index
    Index {
        input: PathBuf,
    },
    /// Show the tables of a build
    Info {
        #[command(flatten)]
        container: ContainerArgs,
    },
    /// Copy one stored file out of a build
    Extract {
        #[command(flatten)]
        container: ContainerArgs,
        /// Virtual path, e.g. Interface/Icons/foo.blp
        path: String,
        #[arg(short = 'O', long)]
        dest: PathBuf,
    },
    /// Edit a build and save it
    Build {
        #[command(flatten)]
        container: ContainerArgs,
        /// Start from an empty build instead of opening one
        #[arg(long)]
        create: bool,
        /// Stage every file under this directory by its relative path
        #[arg(long)]
        source: Option<PathBuf>,
        /// VIRTUAL=FILE, repeatable
        #[arg(long = "add")]
        add: Vec<String>,
        /// VIRTUAL, repeatable
        #[arg(long = "remove")]
        remove: Vec<String>,
        /// OLD=NEW, repeatable
        #[arg(long = "rename")]
        rename: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {

        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode { input, output, level, chunk_size } => {
            let data = std::fs::read(&input)?;
            let spec = if level == 0 { ChunkSpec::stored() } else { ChunkSpec::zlib(level) };
            let spec = if chunk_size == 0 { spec } else { spec.with_size(chunk_size * 1024) };
            let framed = blte::encode(&data, &[spec])?;
            std::fs::write(&output, &framed.bytes)?;
            println!("  content key  {}", framed.content_key);
            println!("  encoded key  {}", framed.encoded_key);
            println!("  size         {} → {} B", data.len(), framed.bytes.len());
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { input, output } => {
            let mut reader = BlteReader::new(Cursor::new(std::fs::read(&input)?))?;
            let chunks = reader.chunk_count();
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            std::fs::write(&output, &data)?;
            println!("Decoded {} chunk(s), {} B → {}", chunks, data.len(), output.display());
        }

        // ── Index ────────────────────────────────────────────────────────────
        Commands::Index { input } => {
            let index = ArchiveIndex::parse(&std::fs::read(&input)?)?;
            println!("{:<34} {:>12} {:>12}", "Encoded key", "Size", "Offset");
            for e in index.entries() {
                println!("{:<34} {:>12} {:>12}", e.key.to_hex(), e.size, e.offset);
            }
            println!("{} entries", index.len());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { container } => {
            let c = open_container(container, false)?;
            println!("── Build ────────────────────────────────────────────────");
            println!("  Build key      {}", c.build_info().get("Build Key").unwrap_or("-"));
            println!("  CDN key        {}", c.build_info().get("CDN Key").unwrap_or("-"));
            println!("  Root           {}", c.build_config().value("root", 0).unwrap_or("-"));
            println!("  Encoding       {} entries, {} especs", c.encoding().len(), c.encoding().especs().len());
            println!("  Root chunks    {}", c.root().chunks().len());
            println!("  Root files     {} (max id {})", c.root().global().len(), c.root().max_id());
            println!("  Local index    {} entries", c.local_index().len());
            println!("  CDN index      {} entries", c.cdn_index().len());
            if let Some(dl) = c.download() {
                println!("  Download       {} entries, {} tags", dl.len(), dl.tags().len());
            }
            if let Some(install) = c.install() {
                println!("  Install        {} entries, {} tags", install.len(), install.tags().len());
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { container, path, dest } => {
            let c = open_container(container, false)?;
            let mut reader = c.open_file(&path)?;
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, &data)?;
            println!("Extracted {} ({} B) → {}", path, data.len(), dest.display());
        }

        // ── Build ────────────────────────────────────────────────────────────
        Commands::Build { container, create, source, add, remove, rename } => {
            let mut c = open_container(container, create)?;
            for pair in &rename {
                let (old, new) = split_pair(pair)?;
                if c.rename_file(old, new) == 0 {
                    eprintln!("Not renamed, {old} is not in the root");
                }
            }
            for path in &remove {
                if c.remove_file(path).is_empty() {
                    eprintln!("Not removed, {path} is not in the root");
                }
            }
            if let Some(dir) = &source {
                let mut files = Vec::new();
                collect_files(dir, &mut files)?;
                for file in files {
                    let rel = file.strip_prefix(dir)?.to_string_lossy().replace('\\', "/");
                    c.add_file_from_disk(&rel, file)?;
                }
            }
            for pair in &add {
                let (path, file) = split_pair(pair)?;
                c.add_file_from_disk(path, file)?;
            }
            let report = c.save()?;
            println!("  build config   {}", report.build_config);
            println!("  CDN config     {}", report.cdn_config);
            println!("  root           {}", report.root);
            println!("  encoding       {}", report.encoding);
            println!("  files written  {}", report.files);
            println!("  entries gone   {}", report.removed);
            if let Some(archive) = report.archive {
                println!("  CDN archive    {archive}");
            }
            c.close()?;
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn settings_from(args: &ContainerArgs) -> Result<ContainerSettings, Box<dyn std::error::Error>> {
    let mut settings = match &args.settings {
        Some(path) => ContainerSettings::from_json_file(path)?,
        None => ContainerSettings::default(),
    };
    if let Some(base) = &args.base {
        settings.base_dir = base.clone();
    }
    if let Some(output) = &args.output {
        settings.output_dir = output.clone();
    }
    if let Some(name) = &args.locale {
        let locale = LocaleFlags::from_name(name).ok_or_else(|| format!("unknown locale '{name}'"))?;
        settings = settings.with_locale(locale);
    }
    if let Some(id) = args.min_id {
        settings = settings.with_minimum_file_id(id);
    }
    if !args.hosts.is_empty() {
        settings = settings.with_hosts(args.hosts.clone());
    }
    if args.sharded {
        settings = settings.with_cdn_layout(CdnLayout::Sharded);
    }
    if args.archive {
        settings = settings.with_write_mode(WriteMode::Both);
    }
    if let Some(cache) = &args.cache {
        settings = settings.with_identity_cache(cache);
    }
    Ok(settings)
}

fn open_container(args: ContainerArgs, create: bool) -> Result<Container, Box<dyn std::error::Error>> {
    let settings = settings_from(&args)?;
    let cache: Box<dyn IdentityCache> = match &settings.identity_cache {
        Some(path) => Box::new(JsonIdentityCache::open(path)?),
        None => Box::new(MemoryIdentityCache::new()),
    };
    let fetcher = fetcher_for(&args);
    Ok(if create {
        Container::create(settings, fetcher, cache)?
    } else {
        Container::open(settings, fetcher, cache)?
    })
}

fn fetcher_for(args: &ContainerArgs) -> Box<dyn Fetcher> {
    if let Some(root) = &args.mirror {
        return Box::new(MirrorFetcher::new(root));
    }
    #[cfg(feature = "http")]
    {
        Box::new(casc_forge::remote::HttpFetcher::new())
    }
    #[cfg(not(feature = "http"))]
    {
        Box::new(casc_forge::remote::OfflineFetcher)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn split_pair(s: &str) -> Result<(&str, &str), String> {
    s.split_once('=').ok_or_else(|| format!("expected A=B, got '{s}'"))
}
