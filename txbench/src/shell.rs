//! `\shell` and `\setshell`.

use std::process::{Command, Stdio};

use txbench_script::Variables;

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("undefined variable \"{0}\"")]
    UndefinedVariable(String),

    #[error("{command}: could not launch shell command: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command}: shell command failed with {status}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
    },

    #[error("{command}: shell command must return an integer (not \"{output}\")")]
    NotAnInteger { command: String, output: String },
}

/// Joins `args` with spaces into a shell command line. An argument `:name` is replaced by the
/// value of the variable; `::text` stands for the literal `:text`.
pub fn command_line(args: &[String], vars: &Variables) -> Result<String, ShellError> {
    let mut line = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        match arg.strip_prefix(':') {
            Some(escaped) if escaped.starts_with(':') => line.push_str(escaped),
            Some(name) => {
                let value = vars
                    .get_string(name)
                    .ok_or_else(|| ShellError::UndefinedVariable(name.to_owned()))?;
                line.push_str(&value);
            }
            None => line.push_str(arg),
        }
    }
    Ok(line)
}

fn sh(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).stdin(Stdio::null());
    cmd
}

/// Runs `command`, failing unless it exits successfully.
pub fn run(command: &str) -> Result<(), ShellError> {
    let status = sh(command).status().map_err(|source| ShellError::Launch {
        command: command.to_owned(),
        source,
    })?;
    if !status.success() {
        return Err(ShellError::Failed {
            command: command.to_owned(),
            status,
        });
    }
    Ok(())
}

/// Runs `command` and parses the first line of its standard output as an integer.
pub fn run_for_integer(command: &str) -> Result<i64, ShellError> {
    let output = sh(command)
        .stderr(Stdio::inherit())
        .output()
        .map_err(|source| ShellError::Launch {
            command: command.to_owned(),
            source,
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next().unwrap_or_default();
    first
        .trim()
        .parse()
        .map_err(|_| ShellError::NotAnInteger {
            command: command.to_owned(),
            output: first.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn vars() -> Variables {
        let mut vars = Variables::new();
        vars.set_int("n", 42).unwrap();
        vars.set_string("word", "hello").unwrap();
        vars
    }

    #[test]
    fn substitutes_arguments() {
        let args = ["echo", ":n", "::n", "a:word", ":word"].map(String::from);
        assert_eq!(command_line(&args, &vars()).unwrap(), "echo 42 :n a:word hello");
    }

    #[test]
    fn undefined_variable() {
        let args = ["echo", ":missing"].map(String::from);
        assert!(matches!(
            command_line(&args, &vars()),
            Err(ShellError::UndefinedVariable(name)) if name == "missing"
        ));
    }

    #[test]
    fn integer_output() {
        assert_eq!(run_for_integer("echo ' 17 '").unwrap(), 17);
        assert!(matches!(
            run_for_integer("echo nope"),
            Err(ShellError::NotAnInteger { output, .. }) if output == "nope"
        ));
    }

    #[test]
    fn exit_status() {
        run("true").unwrap();
        assert!(matches!(run("exit 3"), Err(ShellError::Failed { .. })));
    }
}
