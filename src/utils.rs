//! Utility functions for directory management and system integration
//!
//! Follows the XDG Base Directory specification:
//!
//! - Config: `~/.config/fwpath/` - `config.json`

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Where the kernel exposes per-interface data
pub const SYS_CLASS_NET: &str = "/sys/class/net";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "fwpath", "fwpath")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

/// Creates `dir` (and parents) readable by the current user only
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Interface names known to the kernel, sorted, loopback excluded
pub fn list_interfaces() -> Vec<String> {
    list_interfaces_in(Path::new(SYS_CLASS_NET))
}

fn list_interfaces_in(root: &Path) -> Vec<String> {
    let mut interfaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string()
                && name != "lo"
            {
                interfaces.push(name);
            }
        }
    }
    interfaces.sort();
    interfaces
}

/// Interfaces whose name is close to `name`, for "did you mean" hints
pub fn similar_interfaces(name: &str) -> Vec<String> {
    let stem: String = name.chars().take_while(|c| !c.is_ascii_digit()).collect();
    if stem.is_empty() {
        return Vec::new();
    }
    list_interfaces()
        .into_iter()
        .filter(|candidate| candidate.starts_with(&stem))
        .collect()
}
