//! Terminal greeter
//!
//! Minimal text front end for the orchestrator: prompts for a username and
//! a password (echo off when attached to a terminal), offers the available
//! sessions and launches the chosen one.

use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::os::fd::{AsFd, BorrowedFd};
use tracing::debug;
use zeroize::Zeroizing;

use crate::auth::AuthResult;
use crate::orchestrator::AuthSessionOrchestrator;
use crate::session::{LaunchResult, SessionId};

/// Outcome of one greeter round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Input closed
    Quit,
    /// Authentication or launch failed; prompt again
    Retry,
    /// Session running
    Launched(SessionId),
}

/// Restores terminal echo when dropped
struct EchoGuard<'fd> {
    fd: BorrowedFd<'fd>,
    saved: Termios,
}

impl<'fd> EchoGuard<'fd> {
    /// Disable echo; `None` when `fd` is not a terminal
    fn disable(fd: BorrowedFd<'fd>) -> Option<Self> {
        let saved = termios::tcgetattr(fd).ok()?;
        let mut silent = saved.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        termios::tcsetattr(fd, SetArg::TCSANOW, &silent).ok()?;
        Some(Self { fd, saved })
    }
}

impl Drop for EchoGuard<'_> {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.saved);
    }
}

/// Line-based greeter over any reader/writer pair
pub struct TerminalGreeter<R, W> {
    input: R,
    output: W,
    /// Silence stdin's terminal while the password is typed
    silence_stdin: bool,
}

impl TerminalGreeter<io::StdinLock<'static>, io::Stdout> {
    /// Greeter on the process's own terminal
    pub fn stdio() -> Self {
        Self {
            input: io::stdin().lock(),
            output: io::stdout(),
            silence_stdin: true,
        }
    }
}

impl<R: BufRead, W: Write> TerminalGreeter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            silence_stdin: false,
        }
    }

    /// One login round against `orchestrator`
    ///
    /// The lock is taken only around orchestrator calls, never while
    /// waiting for input.
    pub fn attempt(
        &mut self,
        orchestrator: &Mutex<AuthSessionOrchestrator>,
        preferred: Option<&SessionId>,
    ) -> io::Result<Attempt> {
        let Some((username, password)) = self.prompt_credentials()? else {
            return Ok(Attempt::Quit);
        };

        let result = orchestrator.lock().authenticate(&username, &password);
        drop(password);
        self.show_auth_result(&result)?;
        if !result.is_authenticated() {
            return Ok(Attempt::Retry);
        }

        let sessions = orchestrator.lock().available_sessions();
        let Some(session) = self.choose_session(&sessions, preferred)? else {
            orchestrator.lock().logout();
            return Ok(Attempt::Quit);
        };

        let launched = orchestrator.lock().launch(&session);
        self.show_launch_result(&session, &launched)?;

        match launched {
            LaunchResult::Launched => Ok(Attempt::Launched(session)),
            LaunchResult::LaunchFailed(_) => {
                orchestrator.lock().logout();
                Ok(Attempt::Retry)
            }
        }
    }

    /// Read username and password; `None` on end of input
    pub fn prompt_credentials(&mut self) -> io::Result<Option<(String, Zeroizing<String>)>> {
        write!(self.output, "login: ")?;
        self.output.flush()?;
        let Some(username) = self.read_line()? else {
            return Ok(None);
        };

        write!(self.output, "Password: ")?;
        self.output.flush()?;
        let password = {
            let stdin = io::stdin();
            let _echo = if self.silence_stdin {
                EchoGuard::disable(stdin.as_fd())
            } else {
                None
            };
            self.read_line()?
        };
        if self.silence_stdin {
            writeln!(self.output)?;
        }

        Ok(password.map(|p| (username.to_string(), p)))
    }

    /// Offer `sessions` and read a choice by number or name
    ///
    /// An empty answer picks `preferred` when offered, else the first
    /// session. Unrecognized answers are asked again.
    pub fn choose_session(
        &mut self,
        sessions: &[SessionId],
        preferred: Option<&SessionId>,
    ) -> io::Result<Option<SessionId>> {
        let default = preferred
            .filter(|p| sessions.contains(p))
            .or_else(|| sessions.first())
            .cloned();
        let Some(default) = default else {
            return Ok(None);
        };

        if sessions.len() == 1 {
            return Ok(Some(default));
        }

        writeln!(self.output, "Sessions:")?;
        for (i, session) in sessions.iter().enumerate() {
            writeln!(self.output, "  {}) {}", i + 1, session)?;
        }

        loop {
            write!(self.output, "Session [{}]: ", default)?;
            self.output.flush()?;

            let Some(answer) = self.read_line()? else {
                return Ok(None);
            };
            let answer = answer.trim();

            if answer.is_empty() {
                return Ok(Some(default));
            }

            if let Ok(n) = answer.parse::<usize>() {
                if let Some(session) = n.checked_sub(1).and_then(|i| sessions.get(i)) {
                    return Ok(Some(session.clone()));
                }
            }

            if let Some(session) = sessions.iter().find(|s| s.as_str() == answer) {
                return Ok(Some(session.clone()));
            }

            writeln!(self.output, "Unknown session: {}", answer)?;
        }
    }

    pub fn show_auth_result(&mut self, result: &AuthResult) -> io::Result<()> {
        match result {
            AuthResult::Authenticated(identity) => {
                let name = if identity.gecos.is_empty() {
                    &identity.username
                } else {
                    &identity.gecos
                };
                writeln!(self.output, "Welcome, {}", name)
            }
            AuthResult::Rejected(reason)
            | AuthResult::AccountInvalid(reason)
            | AuthResult::BackendError(reason)
            | AuthResult::InputError(reason) => writeln!(self.output, "Login failed: {}", reason),
        }
    }

    pub fn show_launch_result(
        &mut self,
        session: &SessionId,
        result: &LaunchResult,
    ) -> io::Result<()> {
        match result {
            LaunchResult::Launched => writeln!(self.output, "Starting {}...", session),
            LaunchResult::LaunchFailed(e) => {
                writeln!(self.output, "Could not start {}: {}", session, e)
            }
        }
    }

    fn read_line(&mut self) -> io::Result<Option<Zeroizing<String>>> {
        let mut line = Zeroizing::new(String::new());
        if self.input.read_line(&mut line)? == 0 {
            debug!("Greeter input closed");
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn greeter(input: &str) -> TerminalGreeter<Cursor<Vec<u8>>, Vec<u8>> {
        TerminalGreeter::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    fn ids(names: &[&str]) -> Vec<SessionId> {
        names.iter().map(|n| SessionId::from(*n)).collect()
    }

    #[test]
    fn test_prompt_credentials() {
        let mut g = greeter("alice\nsecret\n");
        let (user, pass) = g.prompt_credentials().unwrap().unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass.as_str(), "secret");

        let shown = String::from_utf8(g.output).unwrap();
        assert!(shown.contains("login: "));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_prompt_credentials_eof() {
        assert!(greeter("").prompt_credentials().unwrap().is_none());
        assert!(greeter("alice\n").prompt_credentials().unwrap().is_none());
    }

    #[test]
    fn test_empty_password_is_passed_through() {
        let (user, pass) = greeter("alice\n\n").prompt_credentials().unwrap().unwrap();
        assert_eq!(user, "alice");
        assert!(pass.is_empty());
    }

    #[test]
    fn test_choose_session() {
        let sessions = ids(&["plasma", "sway", "failsafe"]);

        assert_eq!(
            greeter("\n").choose_session(&sessions, None).unwrap(),
            Some(SessionId::from("plasma"))
        );
        assert_eq!(
            greeter("\n")
                .choose_session(&sessions, Some(&SessionId::from("sway")))
                .unwrap(),
            Some(SessionId::from("sway"))
        );
        assert_eq!(
            greeter("3\n").choose_session(&sessions, None).unwrap(),
            Some(SessionId::from("failsafe"))
        );
        assert_eq!(
            greeter("bogus\nsway\n").choose_session(&sessions, None).unwrap(),
            Some(SessionId::from("sway"))
        );
    }

    #[test]
    fn test_single_session_needs_no_choice() {
        assert_eq!(
            greeter("").choose_session(&ids(&["failsafe"]), None).unwrap(),
            Some(SessionId::from("failsafe"))
        );
    }
}
