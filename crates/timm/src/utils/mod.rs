use crate::errors::CliError;
use miette::Result;
use regex::Regex;

pub mod config;
pub mod game;

#[macro_export]
macro_rules! println_pad {
    ($($arg:tt)*) => {{
        let __s = format!($($arg)*);
        for __line in __s.lines() {
            println!("    {}", __line);
        }
    }};
}

pub fn is_valid_slug(name: impl AsRef<str>) -> bool {
    Regex::new(r"^[[:word:]-]+$")
        .map(|re| re.is_match(name.as_ref()))
        .unwrap_or(false)
}

pub fn validate_mod_name(name: impl AsRef<str>) -> Result<()> {
    let name_str = name.as_ref();
    if !is_valid_slug(name_str) || name_str.eq_ignore_ascii_case(timm_overlay::BASE_CONTENT_ID) {
        return Err(CliError::invalid_mod_name(name_str.to_string(), None).into());
    }

    Ok(())
}

pub fn validate_version_format(version: impl AsRef<str>) -> Result<()> {
    let version_str = version.as_ref();
    if semver::Version::parse(version_str).is_err() {
        return Err(CliError::invalid_version(version_str.to_string(), None).into());
    }

    Ok(())
}
