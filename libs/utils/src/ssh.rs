use tokio::process::Command;

use crate::exec::shell_quote;

/// Builds `ssh <host> <remote command>` with the options used for every hop.
///
/// Each element of `remote` is quoted, since ssh joins its arguments into a single string
/// that the remote shell expands.
pub fn command<I, S>(host: &str, remote: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut cmd = Command::new("ssh");
    cmd.args(["-n", "-q", "-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no", host]);
    let remote = remote
        .into_iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ");
    cmd.arg(remote);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_remote_arguments() {
        let cmd = command("sdw1", ["/usr/local/gpupgrade/gpupgrade", "agent", "--state-directory", "/home/gp adm/.gpupgrade"]);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[6], "sdw1");
        assert_eq!(
            args[7],
            "/usr/local/gpupgrade/gpupgrade agent --state-directory '/home/gp adm/.gpupgrade'"
        );
    }
}
