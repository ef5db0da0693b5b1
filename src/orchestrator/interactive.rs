//! Interactive single-stepping for DEBUG mode.
//!
//! Between phases the operator gets a `[n]ext / [i]nteractive / [q]uit`
//! prompt read as a single key (raw mode on POSIX). `[i]` opens a free-form
//! prompt editor fed to the master provider: Esc then Enter sends, Ctrl+U
//! clears, Ctrl+C exits; the buffer is preserved across entries.
//!
//! The key handling is a pure state machine over characters so it can be
//! driven by a real TTY or by tests.

/// Operator decision at a phase boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    Next,
    Interactive,
    Quit,
}

/// What the prompt editor decided after a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// Keep editing.
    Pending,
    /// Esc+Enter: send the buffer.
    Send(String),
    /// Ctrl+C: leave the editor, buffer preserved.
    Exit,
}

/// Terminal input abstraction; the production impl reads the TTY in raw
/// mode, tests feed scripted characters.
pub trait TerminalInput {
    fn read_key(&mut self) -> std::io::Result<char>;
}

/// Raw-mode stdin reader (POSIX; unsupported elsewhere).
pub struct RawTty;

#[cfg(not(unix))]
impl TerminalInput for RawTty {
    fn read_key(&mut self) -> std::io::Result<char> {
        Err(std::io::Error::other(
            "raw terminal input is only supported on POSIX",
        ))
    }
}

#[cfg(unix)]
impl TerminalInput for RawTty {
    fn read_key(&mut self) -> std::io::Result<char> {
        use std::io::Read;
        use std::os::fd::AsRawFd;

        let stdin = std::io::stdin();
        let fd = stdin.as_raw_fd();

        // Single-char read without waiting for Enter: flip the terminal to
        // raw, read one byte, restore.
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut original) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let mut raw = original;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 1;
            raw.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(fd, libc::TCSADRAIN, &raw) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            let mut buf = [0u8; 1];
            let result = stdin.lock().read_exact(&mut buf);
            libc::tcsetattr(fd, libc::TCSADRAIN, &original);
            result?;
            Ok(buf[0] as char)
        }
    }
}

const CTRL_C: char = '\x03';
const CTRL_U: char = '\x15';
const ESC: char = '\x1b';

/// Multi-line prompt editor with a preserved buffer.
#[derive(Debug, Default)]
pub struct PromptEditor {
    buffer: String,
    /// Set once Esc was pressed; the next Enter sends.
    escape_armed: bool,
}

impl PromptEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Feed one key; the buffer survives `Exit` so the operator can resume.
    pub fn feed(&mut self, key: char) -> EditorEvent {
        match key {
            CTRL_C => {
                self.escape_armed = false;
                EditorEvent::Exit
            }
            CTRL_U => {
                self.buffer.clear();
                self.escape_armed = false;
                EditorEvent::Pending
            }
            ESC => {
                self.escape_armed = true;
                EditorEvent::Pending
            }
            '\r' | '\n' => {
                if self.escape_armed {
                    self.escape_armed = false;
                    EditorEvent::Send(self.buffer.clone())
                } else {
                    self.buffer.push('\n');
                    EditorEvent::Pending
                }
            }
            '\x7f' | '\x08' => {
                self.buffer.pop();
                self.escape_armed = false;
                EditorEvent::Pending
            }
            other => {
                self.buffer.push(other);
                self.escape_armed = false;
                EditorEvent::Pending
            }
        }
    }
}

/// The interactive debugger driven between phases.
pub struct InteractiveDebugger<T: TerminalInput> {
    input: T,
    editor: PromptEditor,
}

impl<T: TerminalInput> InteractiveDebugger<T> {
    pub fn new(input: T) -> Self {
        Self {
            input,
            editor: PromptEditor::new(),
        }
    }

    /// Block on a single `[n]/[i]/[q]` key.
    pub fn ask_action(&mut self) -> std::io::Result<DebugAction> {
        eprint!("[n]ext / [i]nteractive / [q]uit > ");
        loop {
            match self.input.read_key()? {
                'n' | 'N' | '\r' | '\n' => return Ok(DebugAction::Next),
                'i' | 'I' => return Ok(DebugAction::Interactive),
                'q' | 'Q' | CTRL_C => return Ok(DebugAction::Quit),
                _ => {}
            }
        }
    }

    /// Run the prompt editor until send or exit. Returns the prompt to feed
    /// the master provider, or `None` on exit. The buffer persists either
    /// way.
    pub fn edit_prompt(&mut self) -> std::io::Result<Option<String>> {
        eprintln!("(Esc+Enter to send, Ctrl+U to clear, Ctrl+C to exit)");
        loop {
            let key = self.input.read_key()?;
            match self.editor.feed(key) {
                EditorEvent::Pending => {}
                EditorEvent::Send(prompt) => return Ok(Some(prompt)),
                EditorEvent::Exit => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Vec<char>);

    impl TerminalInput for Scripted {
        fn read_key(&mut self) -> std::io::Result<char> {
            if self.0.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "script exhausted",
                ));
            }
            Ok(self.0.remove(0))
        }
    }

    #[test]
    fn test_ask_action_keys() {
        let mut debugger = InteractiveDebugger::new(Scripted(vec!['x', 'n']));
        assert_eq!(debugger.ask_action().unwrap(), DebugAction::Next);

        let mut debugger = InteractiveDebugger::new(Scripted(vec!['i']));
        assert_eq!(debugger.ask_action().unwrap(), DebugAction::Interactive);

        let mut debugger = InteractiveDebugger::new(Scripted(vec!['q']));
        assert_eq!(debugger.ask_action().unwrap(), DebugAction::Quit);
    }

    #[test]
    fn test_editor_escape_enter_sends() {
        let mut editor = PromptEditor::new();
        for c in "fix the test".chars() {
            assert_eq!(editor.feed(c), EditorEvent::Pending);
        }
        assert_eq!(editor.feed(ESC), EditorEvent::Pending);
        assert_eq!(
            editor.feed('\r'),
            EditorEvent::Send("fix the test".to_string())
        );
    }

    #[test]
    fn test_editor_plain_enter_is_newline() {
        let mut editor = PromptEditor::new();
        editor.feed('a');
        editor.feed('\r');
        editor.feed('b');
        assert_eq!(editor.buffer(), "a\nb");
    }

    #[test]
    fn test_editor_ctrl_u_clears() {
        let mut editor = PromptEditor::new();
        editor.feed('x');
        editor.feed('y');
        editor.feed(CTRL_U);
        assert_eq!(editor.buffer(), "");
    }

    #[test]
    fn test_editor_ctrl_c_preserves_buffer() {
        let mut editor = PromptEditor::new();
        editor.feed('k');
        assert_eq!(editor.feed(CTRL_C), EditorEvent::Exit);
        assert_eq!(editor.buffer(), "k");

        // Re-entering continues with the same buffer.
        editor.feed('!');
        editor.feed(ESC);
        assert_eq!(editor.feed('\n'), EditorEvent::Send("k!".to_string()));
    }

    #[test]
    fn test_editor_escape_disarmed_by_other_keys() {
        let mut editor = PromptEditor::new();
        editor.feed(ESC);
        editor.feed('z');
        // Enter after Esc+z is just a newline.
        assert_eq!(editor.feed('\r'), EditorEvent::Pending);
        assert_eq!(editor.buffer(), "z\n");
    }

    #[test]
    fn test_debugger_edit_prompt_round_trip() {
        let mut keys: Vec<char> = "hello".chars().collect();
        keys.push(ESC);
        keys.push('\r');
        let mut debugger = InteractiveDebugger::new(Scripted(keys));
        assert_eq!(debugger.edit_prompt().unwrap(), Some("hello".to_string()));

        // Buffer preserved for the next entry.
        assert_eq!(debugger.editor.buffer(), "hello");
    }
}
