mod paths;
mod process;

pub use paths::{AppPaths, AppPathsError, engine_user_dir};
pub use process::{ProcessOutput, run_process};
