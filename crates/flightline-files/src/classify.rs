//! Hazard classification of inbound file names.
//!
//! Classification never changes how a file is stored. It only tells the
//! presentation layer to suppress auto-open and auto-save.

/// Executable-like extensions (lowercase, without the dot)
pub const HAZARDOUS_EXTENSIONS: &[&str] = &[
    // Windows executables and installers
    "exe", "msi", "bat", "cmd", "com", "scr", "pif", "cpl", "msc", "dll", "gadget", "scf",
    // Script hosts
    "js", "jse", "vbs", "vbe", "wsf", "wsh", "hta", "ps1", "psm1", "jar",
    // Shell scripts
    "sh", "bash", "zsh", "csh", "ksh", "command", "run",
    // Registry, shortcuts
    "reg", "lnk", "url",
    // Packages and disk images
    "app", "dmg", "pkg", "deb", "rpm", "apk", "appimage", "iso", "img", "vhd",
    // Native code
    "bin", "so", "dylib",
];

/// Last extension of `name`, lowercased
///
/// Trailing dots and spaces are ignored since several platforms strip them
/// when the file is saved.
pub fn extension(name: &str) -> Option<String> {
    let trimmed = name.trim_end_matches(['.', ' ']);
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let (stem, ext) = base.rsplit_once('.')?;
    if ext.is_empty() || stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Returns true if `name` carries an executable-like extension
pub fn is_hazardous(name: &str) -> bool {
    extension(name).is_some_and(|ext| HAZARDOUS_EXTENSIONS.contains(&ext.as_str()))
}
