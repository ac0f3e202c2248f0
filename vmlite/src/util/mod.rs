mod process;
mod retry;

pub use process::{is_process_alive, kill_process, run_and_capture, run_for_status};
pub use retry::{TimeoutAction, try_action_for};
