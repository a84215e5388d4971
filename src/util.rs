//! Path helpers shared by the SSH configuration and credential modules.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If the `HOME` environment variable is not set, the input is returned
/// unchanged.
///
/// # Examples
///
/// ```
/// # use landfall::util::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/config"), format!("{home}/.ssh/config"));
/// assert_eq!(expand_tilde("/etc/ssh/ssh_config"), "/etc/ssh/ssh_config");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Reads a UTF-8 file through a capability handle on its parent directory.
///
/// Relative paths are resolved against the current directory.
///
/// # Errors
///
/// Returns the underlying I/O error when the directory cannot be opened or
/// the file cannot be read.
pub fn read_to_string_ambient(path: &Utf8Path) -> std::io::Result<String> {
    let (dir_path, file_path) = split_parent(path)?;
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())?;
    dir.read_to_string(file_path)
}

fn split_parent(path: &Utf8Path) -> std::io::Result<(&Utf8Path, &Utf8Path)> {
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path has no file name: {path}"),
        )
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    Ok((parent, Utf8Path::new(file_name)))
}
