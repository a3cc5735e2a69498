use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use mar::Compression;

#[derive(Parser)]
#[command(name = "mar")]
#[command(about = "Utility for managing MAR (Mozilla ARchive) files")]
#[command(disable_version_flag = true)]
#[command(group = ArgGroup::new("action").required(true))]
pub struct Cli {
    /// Print out MAR contents
    #[arg(short = 't', value_name = "MARFILE", group = "action")]
    pub list: Option<PathBuf>,

    /// Print out MAR contents including signatures and product information
    #[arg(short = 'T', value_name = "MARFILE", group = "action")]
    pub list_detailed: Option<PathBuf>,

    /// Extract a MAR file into the current directory
    #[arg(short = 'x', value_name = "MARFILE", group = "action")]
    pub extract: Option<PathBuf>,

    /// Create a MAR file from the given paths
    #[arg(short = 'c', value_name = "MARFILE", group = "action")]
    pub create: Option<PathBuf>,

    /// Verify the signatures of a MAR file
    #[arg(short = 'v', value_name = "MARFILE", group = "action")]
    pub verify: Option<PathBuf>,

    /// Compress members with bzip2 when creating
    #[arg(short = 'j', conflicts_with = "xz")]
    pub bzip2: bool,

    /// Compress members with xz when creating
    #[arg(short = 'J')]
    pub xz: bool,

    /// Sign or verify with the given key; either a PEM file path or a
    /// built-in key set named like :mozilla-release (repeatable)
    #[arg(short = 'k', value_name = "KEY")]
    pub keyfiles: Vec<String>,

    /// Channel this MAR file is applicable to
    #[arg(short = 'H', value_name = "CHANNEL")]
    pub channel: Option<String>,

    /// Product/version string
    #[arg(short = 'V', value_name = "VERSION")]
    pub productversion: Option<String>,

    /// Change to this directory before creating or extracting; the
    /// location of MARFILE is not affected
    #[arg(short = 'C', value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long)]
    pub verbose: bool,

    /// Files and directories to add when creating
    #[arg(value_name = "PATH")]
    pub files: Vec<PathBuf>,
}

impl Cli {
    pub fn compression(&self) -> Compression {
        if self.bzip2 {
            Compression::Bz2
        } else if self.xz {
            Compression::Xz
        } else {
            Compression::None
        }
    }
}

#[cfg(test)]
mod test_cli {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn argument_definitions_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exactly_one_action_is_required() {
        assert!(Cli::try_parse_from(["mar"]).is_err());
        assert!(Cli::try_parse_from(["mar", "-t", "a.mar", "-x", "a.mar"]).is_err());
        let cli = Cli::try_parse_from(["mar", "-c", "a.mar", "-j", "docs"]).unwrap();
        assert_eq!(cli.create.as_deref().unwrap().to_str(), Some("a.mar"));
        assert_eq!(cli.compression(), Compression::Bz2);
        assert_eq!(cli.files.len(), 1);
    }
}
