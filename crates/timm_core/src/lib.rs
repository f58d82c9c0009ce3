//! Core shared logic for the Tactical Intervention Mod Manager.
//!
//! This crate knows where things live inside a game install. It is used by the
//! `timm` CLI to build the paths the mount engine in `timm_overlay` works on.

mod game_path;
mod layout;

pub use game_path::{auto_detect_game_dir, is_valid_game_dir, GAME_FOLDER_NAME};
pub use layout::{GameLayout, LayoutError, DEFAULT_BASE_CONTENT_DIR};
