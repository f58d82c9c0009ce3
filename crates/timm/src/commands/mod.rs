mod config;
mod mount;
mod status;

pub use config::{auto_detect_game_dir, reset_config, set_game_dir, show_config};
pub use mount::{
    forget_mod, mount_base_content, mount_mod, register_mod, unmount_mod, RegisterModArgs,
};
pub use status::{reconcile_mounts, show_status};
