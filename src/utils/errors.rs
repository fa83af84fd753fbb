//! User-Friendly Error Formatting
//!
//! Startup failures of the login manager, with troubleshooting hints.

use std::fmt::Write;

/// Format error for the operator at the console
pub fn format_user_error(error: &anyhow::Error) -> String {
    let mut output = String::new();

    writeln!(&mut output).ok();
    writeln!(
        &mut output,
        "╔════════════════════════════════════════════════════════════╗"
    )
    .ok();
    writeln!(
        &mut output,
        "║                     ERROR                                  ║"
    )
    .ok();
    writeln!(
        &mut output,
        "╚════════════════════════════════════════════════════════════╝"
    )
    .ok();
    writeln!(&mut output).ok();

    // Context chain as one string so wrapped causes are matched too
    let error_msg = format!("{:#}", error);

    if error_msg.contains("PAM") || error_msg.contains("pam") {
        format_pam_error(&mut output);
    } else if error_msg.contains("root") || error_msg.contains("Permission denied") {
        format_privilege_error(&mut output);
    } else if error_msg.contains("audit") {
        format_audit_error(&mut output);
    } else if error_msg.contains("config") {
        format_config_error(&mut output);
    } else {
        format_generic_error(&mut output, &error_msg);
    }

    writeln!(&mut output).ok();
    writeln!(
        &mut output,
        "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━"
    )
    .ok();
    writeln!(&mut output, "Technical Details:").ok();
    writeln!(&mut output).ok();
    writeln!(&mut output, "{:#}", error).ok();
    writeln!(&mut output).ok();

    writeln!(
        &mut output,
        "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━"
    )
    .ok();
    writeln!(&mut output, "Need Help?").ok();
    writeln!(
        &mut output,
        "  - Run with --verbose for detailed logs: lamco-login -vv"
    )
    .ok();
    writeln!(&mut output, "  - Check the audit log: /var/log/lamco-login/audit.log").ok();
    writeln!(
        &mut output,
        "╚════════════════════════════════════════════════════════════╝"
    )
    .ok();

    output
}

fn format_pam_error(output: &mut String) {
    writeln!(output, "Authentication Service Error (PAM)").ok();
    writeln!(output).ok();
    writeln!(output, "Could not set up the PAM authentication service.").ok();
    writeln!(output).ok();
    writeln!(output, "Common Causes:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. PAM service file missing").ok();
    writeln!(output, "     → Check: ls /etc/pam.d/login").ok();
    writeln!(output, "     → Or set [auth] pam_service in login.toml").ok();
    writeln!(output).ok();
    writeln!(output, "  2. Built without PAM support").ok();
    writeln!(output, "     → Rebuild with the default features (pam-auth)").ok();
    writeln!(output, "     → Requires libpam0g-dev (Debian) or pam-devel (Fedora)").ok();
}

fn format_privilege_error(output: &mut String) {
    writeln!(output, "Insufficient Privileges").ok();
    writeln!(output).ok();
    writeln!(
        output,
        "Starting user sessions requires changing user and group IDs."
    )
    .ok();
    writeln!(output).ok();
    writeln!(output, "  1. Run as root (normally started by systemd on a VT)").ok();
    writeln!(
        output,
        "  2. For testing only: lamco-login --allow-unprivileged"
    )
    .ok();
}

fn format_audit_error(output: &mut String) {
    writeln!(output, "Audit Log Error").ok();
    writeln!(output).ok();
    writeln!(output, "Could not prepare the audit log.").ok();
    writeln!(output).ok();
    writeln!(output, "  1. Check the directory is writable: /var/log/lamco-login/").ok();
    writeln!(output, "  2. Or change [auth] audit_log in login.toml").ok();
}

fn format_config_error(output: &mut String) {
    writeln!(output, "Configuration Error").ok();
    writeln!(output).ok();
    writeln!(output, "Problem with configuration file.").ok();
    writeln!(output).ok();
    writeln!(output, "Common Causes:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. Configuration file not found").ok();
    writeln!(
        output,
        "     → Default location: /etc/lamco-login/login.toml"
    )
    .ok();
    writeln!(
        output,
        "     → Or specify: lamco-login -c /path/to/login.toml"
    )
    .ok();
    writeln!(output).ok();
    writeln!(output, "  2. Invalid TOML syntax").ok();
    writeln!(output, "     → Check for typos, missing quotes, etc.").ok();
    writeln!(output).ok();
    writeln!(output, "  3. Invalid values").ok();
    writeln!(output, "     → sessions.directories must not be empty").ok();
    writeln!(output, "     → environment names must not contain '='").ok();
}

fn format_generic_error(output: &mut String, error: &str) {
    writeln!(output, "Login Manager Error").ok();
    writeln!(output).ok();
    writeln!(output, "Error: {}", error).ok();
}
