use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::files::{IMAGE_EXTENSIONS, SortField, SortOrder};

pub const HELP_KEYS: &str = "\
Key Bindings:
  Esc / q       : Quit
  Left / h      : Previous image
  Right / l     : Next image
  Space         : Next image
  Home          : Go to first image
  End           : Go to last image
  F5            : Rescan folder
  s             : Toggle sort by name / date
  o             : Toggle ascending / descending
  Ctrl+V        : Show image from clipboard
";

const MB: u64 = 1024 * 1024;
const DEFAULT_CACHE_BUDGET: u64 = 128 * MB;
pub const DEFAULT_PREFETCH_COUNT: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortArg {
    Name,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrderArg {
    Asc,
    Desc,
}

#[derive(Parser)]
#[command(name = "iv", about = "A simple image viewer", after_help = HELP_KEYS)]
pub struct Cli {
    /// Image to open; its folder becomes browsable
    pub path: Option<PathBuf>,

    /// Memory budget for decoded images (e.g. 512MB, 2GB). Default: 128MB.
    #[arg(short, long)]
    pub memory: Option<String>,

    /// How many neighbours around the current image to prefetch
    #[arg(short, long, default_value_t = DEFAULT_PREFETCH_COUNT)]
    pub prefetch: usize,

    /// Sort folder contents by
    #[arg(long, value_enum, default_value = "name")]
    pub sort: SortArg,

    /// Sort direction
    #[arg(long, value_enum, default_value = "asc")]
    pub order: OrderArg,

    /// Comma-separated file extensions to browse (default: all supported)
    #[arg(long, value_delimiter = ',')]
    pub extensions: Vec<String>,
}

/// Tunables for the load/cache pipeline.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub cache_budget: u64,
    pub prefetch_count: usize,
    pub extensions: Vec<String>,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            cache_budget: DEFAULT_CACHE_BUDGET,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            extensions: IMAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            sort_field: SortField::Name,
            sort_order: SortOrder::Ascending,
        }
    }
}

impl Cli {
    pub fn viewer_config(&self) -> Result<ViewerConfig, ConfigError> {
        let cache_budget = match &self.memory {
            Some(s) => parse_memory_budget(s)?,
            None => default_memory_budget(),
        };
        let extensions = if self.extensions.is_empty() {
            ViewerConfig::default().extensions
        } else {
            self.extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect()
        };
        Ok(ViewerConfig {
            cache_budget,
            prefetch_count: self.prefetch,
            extensions,
            sort_field: match self.sort {
                SortArg::Name => SortField::Name,
                SortArg::Date => SortField::Modified,
            },
            sort_order: match self.order {
                OrderArg::Asc => SortOrder::Ascending,
                OrderArg::Desc => SortOrder::Descending,
            },
        })
    }
}

pub fn parse_memory_budget(s: &str) -> Result<u64, ConfigError> {
    let upper = s.trim().to_uppercase();
    let (num, unit) = if let Some(num) = upper.strip_suffix("GB") {
        (num, 1024 * MB)
    } else if let Some(num) = upper.strip_suffix("MB") {
        (num, MB)
    } else {
        (upper.as_str(), MB)
    };
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| ConfigError::MemorySize(s.to_owned()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::MemorySize(s.to_owned()));
    }
    Ok((value * unit as f64) as u64)
}

/// 128MB, or a tenth of physical memory on machines where that is smaller.
pub fn default_memory_budget() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    match sys.total_memory() / 10 {
        0 => DEFAULT_CACHE_BUDGET,
        tenth => tenth.min(DEFAULT_CACHE_BUDGET),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sizes() {
        assert_eq!(parse_memory_budget("512MB").unwrap(), 512 * MB);
        assert_eq!(parse_memory_budget(" 2gb ").unwrap(), 2048 * MB);
        assert_eq!(parse_memory_budget("1.5GB").unwrap(), 1536 * MB);
        assert_eq!(parse_memory_budget("64").unwrap(), 64 * MB);
        assert_eq!(parse_memory_budget("0").unwrap(), 0);
        assert!(parse_memory_budget("lots").is_err());
        assert!(parse_memory_budget("-1MB").is_err());
    }

    #[test]
    fn cli_maps_to_config() {
        let cli = Cli::parse_from([
            "iv", "pic.png", "-m", "256MB", "-p", "4", "--sort", "date", "--order", "desc",
            "--extensions", "PNG,.jpg",
        ]);
        let cfg = cli.viewer_config().unwrap();
        assert_eq!(cli.path.as_deref(), Some(std::path::Path::new("pic.png")));
        assert_eq!(cfg.cache_budget, 256 * MB);
        assert_eq!(cfg.prefetch_count, 4);
        assert_eq!(cfg.sort_field, SortField::Modified);
        assert_eq!(cfg.sort_order, SortOrder::Descending);
        assert_eq!(cfg.extensions, ["png", "jpg"]);
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["iv"]);
        let cfg = cli.viewer_config().unwrap();
        assert!(cli.path.is_none());
        assert_eq!(cfg.prefetch_count, DEFAULT_PREFETCH_COUNT);
        assert!(cfg.cache_budget > 0 && cfg.cache_budget <= DEFAULT_CACHE_BUDGET);
        assert!(cfg.extensions.iter().any(|e| e == "png"));
    }
}
