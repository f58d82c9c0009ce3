//! Tactical Intervention install detection and validation utilities.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use sysinfo::{Disks, System};

/// Name of the game's root folder inside a Steam library.
pub const GAME_FOLDER_NAME: &str = "Tactical Intervention";

/// Validates if a path points to a Tactical Intervention install root.
pub fn is_valid_game_dir(path: &Utf8Path) -> bool {
    path.file_name() == Some(GAME_FOLDER_NAME)
        && path.join("tacint").is_dir()
        && path.join("bin").is_dir()
}

fn game_dir_in_library(library: &Utf8Path) -> Utf8PathBuf {
    library.join("steamapps").join("common").join(GAME_FOLDER_NAME)
}

/// Get all available drives using sysinfo (cross-platform).
fn get_available_drives() -> Vec<String> {
    let disks = Disks::new_with_refreshed_list();

    let mut drives: Vec<String> = disks
        .iter()
        .filter_map(|disk| disk.mount_point().to_str().map(|s| s.to_string()))
        .collect();

    // Fallback to common Windows drives if detection fails
    if drives.is_empty() && cfg!(target_os = "windows") {
        drives = ["C:", "D:", "E:", "F:"].into_iter().map(String::from).collect();
    }

    drives
}

/// Extract library roots from a Steam `libraryfolders.vdf`.
///
/// Only the `"path"` keys are of interest, so this reads them line by line
/// instead of parsing the full KeyValues format.
fn parse_library_folders(contents: &str) -> Vec<Utf8PathBuf> {
    contents
        .lines()
        .filter_map(|line| {
            let mut quoted = line.split('"').skip(1).step_by(2);
            match (quoted.next(), quoted.next()) {
                (Some("path"), Some(value)) => Some(Utf8PathBuf::from(value.replace("\\\\", "\\"))),
                _ => None,
            }
        })
        .collect()
}

/// Library roots listed by a Steam install, including the install itself.
fn libraries_of_steam(steam_root: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut libraries = vec![steam_root.to_path_buf()];
    let vdf = steam_root.join("steamapps").join("libraryfolders.vdf");
    if let Ok(contents) = fs::read_to_string(&vdf) {
        libraries.extend(parse_library_folders(&contents));
    }
    libraries
}

/// Detect the game from a running Steam client using sysinfo.
fn detect_from_running_steam() -> Option<Utf8PathBuf> {
    let system = System::new_all();

    for name in ["steam.exe", "steam"] {
        for process in system.processes_by_name(name.as_ref()) {
            let Some(steam_root) = process
                .exe()
                .and_then(|p| p.parent())
                .and_then(|p| Utf8PathBuf::from_path_buf(p.to_path_buf()).ok())
            else {
                continue;
            };

            if let Some(found) = libraries_of_steam(&steam_root)
                .iter()
                .map(|lib| game_dir_in_library(lib))
                .find(|dir| is_valid_game_dir(dir))
            {
                return Some(found);
            }
        }
    }
    None
}

/// Check default Steam locations in the user's home directory.
fn detect_from_home() -> Option<Utf8PathBuf> {
    let home = std::env::var("HOME").ok()?;
    let home = Utf8PathBuf::from(home);

    [
        home.join(".steam").join("steam"),
        home.join(".local").join("share").join("Steam"),
    ]
    .iter()
    .flat_map(|steam| libraries_of_steam(steam))
    .map(|lib| game_dir_in_library(&lib))
    .find(|dir| is_valid_game_dir(dir))
}

/// Check common library locations on all available drives.
fn detect_from_common_paths() -> Option<Utf8PathBuf> {
    let drives = get_available_drives();
    let mut libraries = Vec::new();

    for drive in &drives {
        let drive_root = Utf8PathBuf::from(drive.trim_end_matches(['\\', '/']));

        libraries.extend(libraries_of_steam(
            &drive_root.join("Program Files (x86)").join("Steam"),
        ));
        libraries.extend(libraries_of_steam(
            &drive_root.join("Program Files").join("Steam"),
        ));
        libraries.push(drive_root.join("Steam"));
        libraries.push(drive_root.join("SteamLibrary"));
    }

    libraries
        .into_iter()
        .map(|lib| game_dir_in_library(&lib))
        .find(|dir| is_valid_game_dir(dir))
}

/// Auto-detect the Tactical Intervention install root.
///
/// Detection methods (in order of reliability):
/// 1. Libraries of a running Steam client
/// 2. Default Steam locations in the home directory
/// 3. Common library paths on every mounted disk
pub fn auto_detect_game_dir() -> Option<Utf8PathBuf> {
    let found = detect_from_running_steam()
        .or_else(detect_from_home)
        .or_else(detect_from_common_paths);

    match &found {
        Some(dir) => tracing::debug!("Detected game directory at {}", dir),
        None => tracing::debug!("No game directory detected"),
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_library_folders() {
        let vdf = r#"
"libraryfolders"
{
	"0"
	{
		"path"		"C:\\Program Files (x86)\\Steam"
		"label"		""
		"apps"
		{
			"228480"		"5301112153"
		}
	}
	"1"
	{
		"path"		"/mnt/games/SteamLibrary"
	}
}
"#;
        assert_eq!(
            parse_library_folders(vdf),
            vec![
                Utf8PathBuf::from(r"C:\Program Files (x86)\Steam"),
                Utf8PathBuf::from("/mnt/games/SteamLibrary"),
            ]
        );
    }

    #[test]
    fn test_is_valid_game_dir() {
        let dir = tempfile::tempdir().unwrap();
        let library = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let game = game_dir_in_library(&library);

        assert!(!is_valid_game_dir(&game));

        fs::create_dir_all(game.join("tacint")).unwrap();
        fs::create_dir_all(game.join("bin")).unwrap();
        assert!(is_valid_game_dir(&game));

        let renamed = library.join("Other");
        fs::rename(&game, &renamed).unwrap();
        assert!(!is_valid_game_dir(&renamed));
    }

    #[test]
    fn test_libraries_of_steam_reads_vdf() {
        let dir = tempfile::tempdir().unwrap();
        let steam = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(steam.join("steamapps")).unwrap();
        fs::write(
            steam.join("steamapps/libraryfolders.vdf"),
            "\"1\"\n{\n\t\"path\"\t\t\"/data/lib\"\n}\n",
        )
        .unwrap();

        assert_eq!(
            libraries_of_steam(&steam),
            vec![steam.clone(), Utf8PathBuf::from("/data/lib")]
        );
    }
}
