use std::{
    ffi::{CString, OsStr, OsString},
    fs::File,
    io,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
    ptr,
};

use libc::{c_char, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};

use crate::system::{
    _exit, can_execute, dup2, set_cloexec, set_nonblocking,
    signal::{consts::SIGPIPE, SignalHandler, SignalHandlerBehavior, SignalSet},
    term::attach_controlling_terminal,
    FileCloser,
};

/// Exit status of a child that could not execute its program, like a shell reports it.
pub(super) const EXEC_FAILED: libc::c_int = 127;

/// Everything the forked child needs, converted before forking so the child does not allocate.
pub(super) struct ExecPlan {
    program: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const c_char>,
    working_dir: Option<CString>,
    priority: Option<libc::c_int>,
}

pub(super) struct LaunchConfig<'a> {
    pub(super) executable: &'a OsStr,
    pub(super) arguments: &'a [OsString],
    pub(super) shell: Option<&'a Path>,
    pub(super) working_dir: Option<&'a Path>,
    pub(super) env: &'a [(OsString, OsString)],
    pub(super) priority: Option<libc::c_int>,
}

fn c_string(bytes: impl Into<Vec<u8>>) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "argument contains an interior nul byte",
        )
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Find `program` on `path_var` the way `execvp` would.
pub(super) fn resolve_program(program: &OsStr, path_var: Option<&OsStr>) -> PathBuf {
    if program.as_bytes().contains(&b'/') {
        return PathBuf::from(program);
    }

    path_var
        .into_iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file() && can_execute(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

impl ExecPlan {
    pub(super) fn new(config: &LaunchConfig<'_>) -> io::Result<Self> {
        let mut environment: Vec<(OsString, OsString)> = std::env::vars_os()
            .filter(|(key, _)| !config.env.iter().any(|(k, _)| k == key))
            .collect();
        environment.extend(config.env.iter().cloned());

        let path_var = environment
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.as_os_str());

        let (program, argv) = match config.shell {
            Some(shell) => {
                let mut command = config.executable.to_os_string();
                for arg in config.arguments {
                    command.push(" ");
                    command.push(arg);
                }
                let argv = vec![
                    c_string(shell.as_os_str().as_bytes())?,
                    c_string("-c")?,
                    c_string(command.into_vec())?,
                ];
                (shell.to_path_buf(), argv)
            }
            None => {
                let mut argv = vec![c_string(config.executable.as_bytes())?];
                for arg in config.arguments {
                    argv.push(c_string(arg.as_bytes())?);
                }
                (resolve_program(config.executable, path_var), argv)
            }
        };

        let envp = environment
            .into_iter()
            .map(|(mut key, value)| {
                key.push("=");
                key.push(value);
                c_string(key.into_vec())
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            program: c_string(program.into_os_string().into_vec())?,
            argv_ptrs: null_terminated(&argv),
            _argv: argv,
            envp_ptrs: null_terminated(&envp),
            _envp: envp,
            working_dir: config
                .working_dir
                .map(|dir| c_string(dir.as_os_str().as_bytes()))
                .transpose()?,
            priority: config.priority,
        })
    }
}

/// What the child's standard streams are connected to.
pub(super) enum ChildStdio<'a> {
    Pipes {
        stdin: Option<&'a File>,
        stdout: Option<&'a File>,
        stderr: Option<&'a File>,
    },
    /// The follower side of a pseudo-terminal, which becomes the controlling terminal.
    Pty(&'a File),
}

fn setup_child(plan: &ExecPlan, original_mask: &SignalSet, stdio: ChildStdio<'_>) -> io::Result<()> {
    original_mask.set_mask()?;
    // An ignored SIGPIPE would survive the exec.
    SignalHandler::register(SIGPIPE, SignalHandlerBehavior::Default)?.forget();

    match stdio {
        ChildStdio::Pipes {
            stdin,
            stdout,
            stderr,
        } => {
            for (end, target) in [
                (stdin, STDIN_FILENO),
                (stdout, STDOUT_FILENO),
                (stderr, STDERR_FILENO),
            ] {
                if let Some(end) = end {
                    dup2(end, target)?;
                }
            }
        }
        ChildStdio::Pty(slave) => {
            attach_controlling_terminal(slave)?;
            for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
                dup2(slave, target)?;
            }
        }
    }

    FileCloser::new().close_the_universe()?;

    if let Some(dir) = &plan.working_dir {
        crate::cutils::cerr(unsafe { libc::chdir(dir.as_ptr()) })?;
    }

    if let Some(priority) = plan.priority {
        // Failing to renice is not a reason to not run the program.
        unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    }

    Ok(())
}

/// Turn the forked child into the planned program. Never returns.
pub(super) fn exec_child(plan: &ExecPlan, original_mask: &SignalSet, stdio: ChildStdio<'_>) -> ! {
    if setup_child(plan, original_mask, stdio).is_ok() {
        unsafe {
            libc::execve(
                plan.program.as_ptr(),
                plan.argv_ptrs.as_ptr(),
                plan.envp_ptrs.as_ptr(),
            )
        };
    }

    _exit(EXEC_FAILED)
}

/// Make the parent side of a channel non-blocking and keep it out of other children.
pub(super) fn prepare_parent_end(file: &File) -> io::Result<()> {
    set_nonblocking(file)?;
    set_cloexec(file, true)
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::{OsStr, OsString},
        path::Path,
    };

    use super::{resolve_program, ExecPlan, LaunchConfig};

    #[test]
    fn programs_with_a_slash_are_not_searched() {
        assert_eq!(
            resolve_program(OsStr::new("./run"), Some(OsStr::new("/bin"))),
            Path::new("./run")
        );
    }

    #[test]
    fn programs_are_found_on_path() {
        let found = resolve_program(OsStr::new("sh"), Some(OsStr::new("/nonexistent:/bin")));
        assert_eq!(found, Path::new("/bin/sh"));

        let missing = resolve_program(OsStr::new("procpty-missing"), Some(OsStr::new("/bin")));
        assert_eq!(missing, Path::new("procpty-missing"));
    }

    #[test]
    fn shell_commands_join_arguments() {
        let arguments = [OsString::from("-n"), OsString::from("'a b'")];
        let plan = ExecPlan::new(&LaunchConfig {
            executable: OsStr::new("echo"),
            arguments: &arguments,
            shell: Some(Path::new("/bin/sh")),
            working_dir: None,
            env: &[],
            priority: None,
        })
        .unwrap();

        assert_eq!(plan.program.to_bytes(), b"/bin/sh");
        let argv: Vec<&[u8]> = plan._argv.iter().map(|s| s.to_bytes()).collect();
        assert_eq!(argv, vec![&b"/bin/sh"[..], b"-c", b"echo -n 'a b'"]);
        assert!(plan.argv_ptrs.last().unwrap().is_null());
    }

    #[test]
    fn environment_overrides_replace_inherited_values() {
        let env = [(OsString::from("PATH"), OsString::from("/procpty-test"))];
        let plan = ExecPlan::new(&LaunchConfig {
            executable: OsStr::new("true"),
            arguments: &[],
            shell: None,
            working_dir: Some(Path::new("/")),
            env: &env,
            priority: Some(5),
        })
        .unwrap();

        let paths: Vec<&[u8]> = plan
            ._envp
            .iter()
            .map(|s| s.to_bytes())
            .filter(|s| s.starts_with(b"PATH="))
            .collect();
        assert_eq!(paths, vec![&b"PATH=/procpty-test"[..]]);
        assert_eq!(plan.working_dir.as_deref().unwrap().to_bytes(), b"/");
    }

    #[test]
    fn interior_nul_is_rejected() {
        let arguments = [OsString::from("a\0b")];
        assert!(ExecPlan::new(&LaunchConfig {
            executable: OsStr::new("echo"),
            arguments: &arguments,
            shell: None,
            working_dir: None,
            env: &[],
            priority: None,
        })
        .is_err());
    }
}
