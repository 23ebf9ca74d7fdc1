use time::OffsetDateTime;

use crate::log_println;

const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

macro_rules! env_or {
    ($key:literal, $default:literal) => {
        option_env!($key).unwrap_or($default)
    };
}

pub struct BannerInfo {
    pub version: &'static str,
    pub build_time: String,
    pub branch: &'static str,
    pub commit_short: &'static str,
    pub dirty: bool,
    pub rust_version: &'static str,
    pub profile: &'static str,
}

impl Default for BannerInfo {
    fn default() -> Self {
        let build_time = option_env!("BUILD_TIME")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .and_then(|t| {
                t.format(time::macros::format_description!(
                    "[year]-[month]-[day] [hour]:[minute] UTC"
                ))
                .ok()
            })
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            version: env!("CARGO_PKG_VERSION"),
            build_time,
            branch: env_or!("GIT_BRANCH", "unknown"),
            commit_short: env_or!("GIT_COMMIT_SHORT", "unknown"),
            dirty: matches!(option_env!("GIT_DIRTY"), Some("true")),
            rust_version: env_or!("RUST_VERSION", "unknown"),
            profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
        }
    }
}

pub fn print_banner(info: &BannerInfo) {
    log_println!();
    log_println!("{GREEN}   ____  __  ____  __ __    _       __  {RESET}");
    log_println!("{GREEN}  / __ \\/  |/  / |/ // /   (_)___  / /__{RESET}");
    log_println!("{GREEN} / /_/ / /|_/ /|   // /__ / / __ \\/  '_/{RESET}");
    log_println!("{GREEN} \\____/_/  /_//_/|_/____//_/_/ /_/_/\\_\\ {RESET}");
    log_println!("{DIM}========================================{RESET}");
    log_println!();

    let commit = if info.dirty {
        format!("{}{YELLOW} (dirty){RESET}", info.commit_short)
    } else {
        info.commit_short.to_string()
    };
    print_row("Version", info.version, CYAN);
    print_row("Build time", &info.build_time, RESET);
    print_row("Branch", info.branch, RESET);
    print_row("Commit", &commit, RESET);
    print_row("Rust", info.rust_version, RESET);
    print_row("Profile", info.profile, YELLOW);
    log_println!();
}

fn print_row(label: &str, value: &str, color: &str) {
    log_println!("  {BOLD}{label:<14}{RESET}{color}{value}{RESET}");
}
