//! Generated schedule entries
//!
//! Emits crontab lines for the two periodic jobs: a daily certificate
//! renewal pass (skip-if-valid makes it cheap) and a weekly expiration
//! report. The operator installs them with `crontab`; nothing here touches
//! the system scheduler directly.

use std::path::Path;

use crate::config::Config;

/// Render the crontab block for periodic renewal and reporting.
pub fn render_crontab(config: &Config, executable: &Path, config_file: &Path) -> String {
    let exe = executable.display();
    let cfg = config_file.display();
    let log = config.schedule.log_file.display();

    let mut out = String::new();
    out.push_str("# certificate lifecycle jobs (generated; reinstall with `warden schedule`)\n");
    out.push_str(&format!(
        "0 {} * * * {exe} --config {cfg} renew >> {log} 2>&1\n",
        config.schedule.renew_hour
    ));
    out.push_str(&format!(
        "0 {} * * 1 {exe} --config {cfg} status --nagios >> {log} 2>&1\n",
        config.schedule.report_hour
    ));
    out
}
