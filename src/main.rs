use std::{
    io::{stdout, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{ensure, Context};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use stockpile::{Archive, ArchiveBuilder, Diagnostics, ResultExt, WriteOptions};
use tap::Pipe;

#[derive(Debug, Parser)]
#[command(version, about = "Pack, inspect and unpack stockpile archives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bundle files into a new archive
    Pack {
        output: PathBuf,

        /// Files to add, as `PATH` or `NAME=PATH` to store under another name
        #[arg(required = true)]
        inputs: Vec<String>,

        #[command(flatten)]
        write: WriteArgs,
    },

    /// Merge the entries of several archives into a new one
    Merge {
        output: PathBuf,

        #[arg(required = true)]
        archives: Vec<PathBuf>,

        #[command(flatten)]
        write: WriteArgs,
    },

    /// List entries with their offsets and sizes
    List { archive: PathBuf },

    /// Print the archive header
    Info { archive: PathBuf },

    /// Write one entry to a file, or to stdout when no output is given
    Extract {
        archive: PathBuf,
        entry: String,
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct WriteArgs {
    /// Compress the payload
    #[arg(short, long)]
    compress: bool,

    /// Store CRC32 checksums of every entry
    #[arg(long)]
    crc: bool,

    /// Refuse to store two entries under the same name
    #[arg(long)]
    unique: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Cli::parse();
    let mut diagnostics = Diagnostics::with_observer(|kind, message| error!("{kind:?}: {message}"));

    match args.command {
        Command::Pack {
            output,
            inputs,
            write,
        } => pack(&mut diagnostics, output, &inputs, &write),
        Command::Merge {
            output,
            archives,
            write,
        } => merge(&mut diagnostics, output, &archives, &write),
        Command::List { archive } => list(&mut diagnostics, archive),
        Command::Info { archive } => print_info(archive),
        Command::Extract {
            archive,
            entry,
            output,
        } => extract(&mut diagnostics, archive, &entry, output),
    }
}

fn builder_for(write: &WriteArgs, capacity: usize) -> anyhow::Result<ArchiveBuilder> {
    ArchiveBuilder::new(capacity, write.crc)?
        .reject_duplicates(write.unique)
        .pipe(Ok)
}

fn pack(
    diagnostics: &mut Diagnostics,
    output: PathBuf,
    inputs: &[String],
    write: &WriteArgs,
) -> anyhow::Result<()> {
    let mut builder = builder_for(write, inputs.len())?;

    for input in inputs {
        let added = match input.split_once('=') {
            Some((name, path)) => builder.append_file_as(path, name),
            None => builder.append_file(input),
        };
        added
            .report(diagnostics)
            .with_context(|| format!("Unable to add {input}"))?;
    }

    info!("packing {} entries into {}", builder.len(), output.display());
    builder
        .finalize_to_path(&output, write.compress)
        .report(diagnostics)
        .with_context(|| format!("Unable to write {}", output.display()))
}

fn merge(
    diagnostics: &mut Diagnostics,
    output: PathBuf,
    archives: &[PathBuf],
    write: &WriteArgs,
) -> anyhow::Result<()> {
    let mut builder = builder_for(write, 0)?;

    for path in archives {
        let archive = Archive::open_path(path)
            .report(diagnostics)
            .with_context(|| format!("Unable to open {}", path.display()))?;
        builder
            .append_archive(&archive)
            .report(diagnostics)
            .with_context(|| format!("Unable to merge {}", path.display()))?;
    }

    let archive = builder.finalize().report(diagnostics)?;
    archive
        .write_to_path(
            &output,
            &WriteOptions::default()
                .compressed(write.compress)
                .crc(write.crc),
        )
        .report(diagnostics)
        .with_context(|| format!("Unable to write {}", output.display()))
}

fn list(diagnostics: &mut Diagnostics, path: PathBuf) -> anyhow::Result<()> {
    let archive = Archive::open_path(&path)
        .report(diagnostics)
        .with_context(|| format!("Unable to open {}", path.display()))?;

    let mut out = BufWriter::new(stdout().lock());
    for entry in archive.entries() {
        writeln!(out, "{:>10} {:>10}  {}", entry.offset(), entry.len(), entry.name_lossy())?;
    }
    writeln!(
        out,
        "{} entries, {} bytes",
        archive.len(),
        archive.payload_len()
    )?;
    out.flush().context("Unable to flush stdout")
}

fn print_info(path: PathBuf) -> anyhow::Result<()> {
    let header = std::fs::File::open(&path)
        .map(std::io::BufReader::new)
        .with_context(|| format!("Unable to open {}", path.display()))?
        .pipe(stockpile::format::Header::read)
        .context("Reading stockpile header")?;

    println!("version            {}.{}", header.version_major, header.version_minor);
    println!("compressed         {}", header.is_compressed());
    println!("crc                {}", header.has_crc());
    println!("entries            {}", header.entry_count.get());
    println!("stored size        {}", header.raw_size.get());
    println!("uncompressed size  {}", header.uncompressed_size.get());
    println!("data origin        {}", header.data_origin.get());
    if header.has_crc() {
        println!("crc origin         {}", header.crc_origin.get());
    }
    Ok(())
}

fn extract(
    diagnostics: &mut Diagnostics,
    path: PathBuf,
    name: &str,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let archive = Archive::open_path(&path)
        .report(diagnostics)
        .with_context(|| format!("Unable to open {}", path.display()))?;
    let entry = archive.entry(name).report(diagnostics)?;

    let extracted = match output {
        Some(output) => {
            ensure!(!output.is_dir(), "{} is a directory", output.display());
            archive.extract_entry_to_path(entry, &output)
        }
        None => archive.extract_entry(entry, stdout().lock()),
    };
    extracted
        .report(diagnostics)
        .with_context(|| format!("Unable to extract {name}"))
}
