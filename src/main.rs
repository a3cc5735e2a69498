use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use ignore::WalkBuilder;
use log::debug;

use mar::format::INFO_TYPE_PRODUCT;
use mar::signing::load_public_key;
use mar::{
    extract, keys, MarError, MarReader, MarWriter, ProductInformation, SigningKey, VerifyOutcome,
    VerifyPolicy,
};

mod cli;
use crate::cli::Cli;

const EXIT_USAGE: i32 = 1;
const EXIT_IO: i32 = 2;
const EXIT_FORMAT: i32 = 3;
const EXIT_VERIFY: i32 = 4;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    if let Err(err) = run(&cli) {
        eprintln!("mar: {}", err);
        process::exit(exit_code(&err));
    }
}

fn exit_code(err: &MarError) -> i32 {
    match err {
        MarError::Io(_) | MarError::SigningFailed(_) | MarError::Crypto(_) => EXIT_IO,
        MarError::FailedSignature(_) | MarError::UnknownSignatureAlgorithm(_) => EXIT_VERIFY,
        _ => EXIT_FORMAT,
    }
}

fn usage(message: &str) -> ! {
    eprintln!("mar: {}", message);
    process::exit(EXIT_USAGE);
}

fn run(cli: &Cli) -> Result<(), MarError> {
    if let Some(path) = &cli.list {
        do_list(path, false)
    } else if let Some(path) = &cli.list_detailed {
        do_list(path, true)
    } else if let Some(path) = &cli.extract {
        do_extract(cli, path)
    } else if let Some(path) = &cli.verify {
        do_verify(cli, path)
    } else if let Some(path) = &cli.create {
        do_create(cli, path)
    } else {
        usage("must specify one of -t, -T, -x, -c or -v");
    }
}

fn do_list(path: &Path, detailed: bool) -> Result<(), MarError> {
    let mut reader = MarReader::open(path)?;

    if detailed {
        match reader.compression_type()? {
            mar::Compression::Xz => println!("MAR data is XZ compressed"),
            mar::Compression::Bz2 => println!("MAR data is BZ2 compressed"),
            mar::Compression::None => {}
        }
        if let Some(block) = reader.signatures()? {
            println!(
                "Signature block found with {} signature(s)",
                block.entries.len()
            );
            for entry in &block.entries {
                println!(
                    "- Signature {} size {}",
                    entry.algorithm_id,
                    entry.signature.len()
                );
            }
            println!();
        }
        if let Some(block) = reader.additional()? {
            println!("{} additional block(s) found:", block.entries.len());
            for entry in &block.entries {
                if entry.info_type == INFO_TYPE_PRODUCT {
                    let info = ProductInformation::parse(&entry.payload)?;
                    println!("  - Product Information Block:");
                    println!("    - MAR channel name: {}", info.channel);
                    println!("    - Product version: {}", info.version);
                    println!();
                } else {
                    println!("  - Unknown additional data (type {})", entry.info_type);
                }
            }
        }
        println!("{:7} {:7} {:7} {}", "SIZE", "MODE", "OFFSET", "NAME");
        for entry in reader.entries() {
            println!(
                "{:<7} {:04o}    {:<7} {}",
                entry.size, entry.mode, entry.offset, entry.name
            );
        }
    } else {
        println!("{:7} {:7} {}", "SIZE", "MODE", "NAME");
        for entry in reader.entries() {
            println!("{:<7} {:04o}    {}", entry.size, entry.mode, entry.name);
        }
    }
    Ok(())
}

fn do_extract(cli: &Cli, path: &Path) -> Result<(), MarError> {
    let marfile = absolute(path)?;
    if let Some(dir) = &cli.chdir {
        std::env::set_current_dir(dir)?;
    }
    let mut reader = MarReader::open(marfile)?;
    extract::extract_all(&mut reader, Path::new("."))
}

fn do_verify(cli: &Cli, path: &Path) -> Result<(), MarError> {
    let mut candidates = Vec::new();
    for selector in &cli.keyfiles {
        if let Some(name) = selector.strip_prefix(':') {
            let ders = match keys::lookup(name) {
                Some(ders) => ders,
                None => usage(&format!(
                    "unknown built-in key set {:?}; known sets: {}",
                    name,
                    keys::KNOWN_NAMES.join(", ")
                )),
            };
            for der in ders {
                candidates.push(load_public_key(der)?);
            }
        } else {
            candidates.push(load_public_key(&fs::read(selector)?)?);
        }
    }
    debug!("verifying with {} candidate key(s)", candidates.len());

    let mut reader = MarReader::open(path)?;
    match reader.verify(&candidates, VerifyPolicy::AnyKey)? {
        VerifyOutcome::NoSignatures => {
            println!("No signatures found");
            Ok(())
        }
        VerifyOutcome::Verified(count) => {
            println!("Verification OK ({} signature(s))", count);
            Ok(())
        }
        VerifyOutcome::FailedSignature(slot) => {
            println!("Verification failed");
            Err(MarError::FailedSignature(slot))
        }
        VerifyOutcome::UnknownSignatureAlgorithm(slot) => {
            println!("Verification failed: no usable key for signature {}", slot);
            Err(MarError::UnknownSignatureAlgorithm(slot))
        }
    }
}

fn do_create(cli: &Cli, path: &Path) -> Result<(), MarError> {
    if cli.files.is_empty() {
        usage("must specify at least one file to add to the MAR file");
    }
    let product_info = match (&cli.channel, &cli.productversion) {
        (Some(channel), Some(version)) => Some(ProductInformation::new(channel, version)?),
        (None, None) => None,
        _ => usage("-H and -V must be specified together"),
    };

    let mut signing_keys = Vec::new();
    for selector in &cli.keyfiles {
        if selector.starts_with(':') {
            usage("built-in key sets hold public keys and cannot sign");
        }
        signing_keys.push(SigningKey::from_bytes(&fs::read(selector)?)?);
    }

    let marfile = absolute(path)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(marfile)?;
    if let Some(dir) = &cli.chdir {
        std::env::set_current_dir(dir)?;
    }

    let mut writer = MarWriter::with_options(file, cli.compression(), signing_keys, product_info)?;
    for path in &cli.files {
        add_path(&mut writer, path)?;
    }
    writer.finish()?;
    Ok(())
}

/// Adds a file, or every file below a directory, to the archive.
fn add_path<F: io::Read + io::Write + io::Seek>(
    writer: &mut MarWriter<F>,
    path: &Path,
) -> Result<(), MarError> {
    if !fs::metadata(path)?.is_dir() {
        return add_file(writer, path);
    }
    let walk = WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    for result in walk {
        let entry = result.map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        if entry.file_type().map_or(false, |t| t.is_file()) {
            add_file(writer, entry.path())?;
        }
    }
    Ok(())
}

fn add_file<F: io::Read + io::Write + io::Seek>(
    writer: &mut MarWriter<F>,
    path: &Path,
) -> Result<(), MarError> {
    let name = member_name(path)?;
    let mode = file_mode(path)?;
    let mut data = File::open(path)?;
    debug!("adding {}", name);
    writer.add(&name, mode, &mut data)
}

/// The archive name for a filesystem path: the path as given, separators
/// normalized to `/`, any leading `./` stripped.
fn member_name(path: &Path) -> Result<String, MarError> {
    let name = path
        .to_str()
        .ok_or_else(|| MarError::UnsafeName(path.to_string_lossy().into_owned()))?;
    let name = name.replace(std::path::MAIN_SEPARATOR, "/");
    Ok(name.trim_start_matches("./").to_string())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32, MarError> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32, MarError> {
    Ok(0o644)
}

fn absolute(path: &Path) -> Result<PathBuf, MarError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
