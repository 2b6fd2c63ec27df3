use nexus_types::{SourceItem, SourceItemKind};

// ── Shell command construction ───────────────────────────────────
//
// Every remote command line is assembled here and nowhere else.
// All user-supplied strings pass through `quote`; no call site
// concatenates raw input into a command.

/// Shell-escape one argument.
pub fn quote(arg: &str) -> String {
    shell_words::quote(arg).into_owned()
}

/// True for names safe to use on the left side of `export NAME=`.
pub fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Environment to export before the command. Names must satisfy
    /// `is_valid_env_name`; values are quoted.
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub sudo: bool,
    pub login_shell: bool,
}

/// Build the full command line for a batch sub-task.
pub fn build_exec_command(command: &str, opts: &CommandOptions) -> String {
    let mut parts = Vec::new();
    for (name, value) in &opts.env {
        parts.push(format!("export {}={}", name, quote(value)));
    }
    if let Some(dir) = &opts.workdir {
        parts.push(format!("cd {}", quote(dir)));
    }
    parts.push(command.to_string());

    let mut full = parts.join(" && ");
    if opts.sudo {
        full = format!("sudo -- sh -c {}", quote(&full));
    }
    if opts.login_shell {
        full = format!("bash -lc {}", quote(&full));
    }
    full
}

/// `command -v` probe; exit 0 means the tool is on PATH.
pub fn probe_command(tool: &str) -> String {
    format!("command -v {}", quote(tool))
}

pub fn mkdir_command(path: &str) -> String {
    format!("mkdir -p {}", quote(path))
}

/// Wrap a transfer command so the target's password or key passphrase
/// is fed by sshpass instead of an interactive prompt.
pub fn sshpass_wrap(secret: &str, command: &str) -> String {
    format!("sshpass -p {} {}", quote(secret), command)
}

pub struct TargetEndpoint<'a> {
    pub user: &'a str,
    pub host: &'a str,
    pub port: u16,
}

/// rsync invocation executed on the source host, pushing one item to
/// the target. Directory sources get a trailing slash so contents
/// land inside the target path rather than one level deeper.
pub fn rsync_command(
    item: &SourceItem,
    target: &TargetEndpoint<'_>,
    target_path: &str,
    keyfile: Option<&str>,
) -> String {
    let mut ssh = format!(
        "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -p {}",
        target.port
    );
    if let Some(key) = keyfile {
        ssh.push_str(&format!(" -i {}", quote(key)));
    }

    let source_path = if item.kind == SourceItemKind::Directory && !item.path.ends_with('/') {
        format!("{}/", item.path)
    } else {
        item.path.clone()
    };

    format!(
        "rsync -avz --progress -e {} {} {}",
        quote(&ssh),
        quote(&source_path),
        quote(&format!(
            "{}@{}:{}",
            target.user, target.host, target_path
        )),
    )
}

/// scp equivalent; `-r` for directories.
pub fn scp_command(
    item: &SourceItem,
    target: &TargetEndpoint<'_>,
    target_path: &str,
    keyfile: Option<&str>,
) -> String {
    let mut flags = format!(
        "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -P {}",
        target.port
    );
    if let Some(key) = keyfile {
        flags.push_str(&format!(" -i {}", quote(key)));
    }
    if item.kind == SourceItemKind::Directory {
        flags.push_str(" -r");
    }

    format!(
        "scp {} {} {}",
        flags,
        quote(&item.path),
        quote(&format!(
            "{}@{}:{}",
            target.user, target.host, target_path
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_item(path: &str) -> SourceItem {
        SourceItem {
            name: "item".into(),
            path: path.into(),
            kind: SourceItemKind::File,
        }
    }

    fn dir_item(path: &str) -> SourceItem {
        SourceItem {
            name: "item".into(),
            path: path.into(),
            kind: SourceItemKind::Directory,
        }
    }

    fn target() -> TargetEndpoint<'static> {
        TargetEndpoint {
            user: "deploy",
            host: "target.example.com",
            port: 2222,
        }
    }

    #[test]
    fn test_quote_neutralizes_injection() {
        assert_eq!(quote("foo; rm -rf /"), "'foo; rm -rf /'");
        let cmd = build_exec_command(
            "ls",
            &CommandOptions {
                workdir: Some("/tmp; reboot".into()),
                ..Default::default()
            },
        );
        // The hostile workdir survives only inside single quotes.
        assert_eq!(cmd, "cd '/tmp; reboot' && ls");
    }

    #[test]
    fn test_env_names() {
        assert!(is_valid_env_name("PATH"));
        assert!(is_valid_env_name("MY_VAR_2"));
        assert!(!is_valid_env_name("2BAD"));
        assert!(!is_valid_env_name("BAD-NAME"));
        assert!(!is_valid_env_name(""));
        assert!(!is_valid_env_name("A B"));
    }

    #[test]
    fn test_build_exec_command_composition() {
        let opts = CommandOptions {
            env: vec![("RAILS_ENV".into(), "production".into())],
            workdir: Some("/srv/app".into()),
            sudo: false,
            login_shell: false,
        };
        assert_eq!(
            build_exec_command("bin/restart", &opts),
            "export RAILS_ENV=production && cd /srv/app && bin/restart"
        );
    }

    #[test]
    fn test_sudo_wraps_whole_pipeline() {
        let opts = CommandOptions {
            workdir: Some("/etc".into()),
            sudo: true,
            ..Default::default()
        };
        let cmd = build_exec_command("cat shadow", &opts);
        assert!(cmd.starts_with("sudo -- sh -c "));
        assert!(cmd.contains("cd /etc"));
    }

    #[test]
    fn test_login_shell_is_outermost() {
        let opts = CommandOptions {
            sudo: true,
            login_shell: true,
            ..Default::default()
        };
        assert!(build_exec_command("id", &opts).starts_with("bash -lc "));
    }

    #[test]
    fn test_rsync_directory_gets_trailing_slash() {
        let cmd = rsync_command(&dir_item("/var/data"), &target(), "/backup", None);
        assert!(cmd.contains("/var/data/"));
        assert!(cmd.contains("rsync -avz --progress -e"));
        assert!(cmd.contains("-p 2222"));
        assert!(cmd.contains("deploy@target.example.com:/backup"));
    }

    #[test]
    fn test_rsync_file_keeps_path() {
        let cmd = rsync_command(&file_item("/var/data.tar"), &target(), "/backup", Some("/tmp/k"));
        assert!(cmd.contains("/var/data.tar"));
        assert!(!cmd.contains("/var/data.tar/"));
        assert!(cmd.contains("-i /tmp/k"));
    }

    #[test]
    fn test_scp_directory_is_recursive() {
        let cmd = scp_command(&dir_item("/var/data"), &target(), "/backup", None);
        assert!(cmd.contains(" -r"));
        assert!(cmd.contains("-P 2222"));
    }

    #[test]
    fn test_scp_file_is_not_recursive() {
        let cmd = scp_command(&file_item("/var/data.tar"), &target(), "/backup", None);
        assert!(!cmd.contains(" -r "));
    }

    #[test]
    fn test_hostile_paths_stay_quoted() {
        let cmd = rsync_command(
            &file_item("/tmp/$(reboot)"),
            &target(),
            "/dest dir",
            None,
        );
        assert!(cmd.contains("'/tmp/$(reboot)'"));
        assert!(cmd.contains("'deploy@target.example.com:/dest dir'"));
    }

    #[test]
    fn test_sshpass_wrap() {
        let wrapped = sshpass_wrap("p4ss word", "rsync -avz a b");
        assert!(wrapped.starts_with("sshpass -p 'p4ss word' rsync"));
    }
}
