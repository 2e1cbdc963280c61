//! CLI - reedline-based controller REPL
//!
//! Drives a provider session interactively: process selection, memory
//! views, disassembly and the hardware-breakpoint debug loop.

use anyhow::Result;
use colored::Colorize;
use reedline::{Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal};
use std::borrow::Cow;

use crate::debug::{DebugEventInfo, DebugState, HardwareBreakpoint};
use crate::protocol::{
    BreakpointRegister, BreakpointSize, BreakpointTrigger, ContinueStatus, ControlAction, Handle,
    ProcessAccess, MAX_INSTRUCTION_LENGTH,
};
use crate::session::{Duplex, Session};

/// Custom prompt for the controller
pub struct ProbePrompt {
    /// Current working address (for navigation commands)
    current_address: u64,
    /// Open process, if any
    process: Option<Handle>,
    /// Debug loop state mirrored from the session
    debug: DebugState,
}

impl ProbePrompt {
    pub fn new() -> Self {
        Self {
            current_address: 0,
            process: None,
            debug: DebugState::Idle,
        }
    }
}

impl Default for ProbePrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for ProbePrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        let status = match self.debug {
            DebugState::Idle => "---",
            DebugState::WaitingForEvent => "run",
            DebugState::EventDelivered => "brk",
            DebugState::Closed => "end",
        };
        let process = self
            .process
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".into());
        Cow::Owned(format!("[{}:{}:{:#x}]", status, process, self.current_address))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// Command parsing result
#[derive(Debug, PartialEq, Eq)]
pub enum ParsedCommand {
    /// Navigate to address: s <addr>
    Seek(u64),
    /// List processes: ps
    Processes,
    /// Open process: o <pid> [r|w|rw]
    Open(u64, ProcessAccess),
    /// Close the open process: oc
    CloseProcess,
    /// Show memory map: dm
    MemoryMap,
    /// Show modules: dmm
    Modules,
    /// Show threads: dpt
    Threads,
    /// Select a thread by handle: dt <handle>
    SelectThread(Handle),
    /// Hex dump: px [n]
    HexDump(usize),
    /// Write hex bytes at the current address: wx <hex>
    WriteHex(Vec<u8>),
    /// Print N instructions: pd [n]
    PrintDisasm(usize),
    /// Suspend, resume or kill: dps / dpr / dk
    Control(ControlAction),
    /// Set breakpoint: db <dr0-3> <addr> [x|w|rw] [1|2|4|8]
    BreakpointSet(HardwareBreakpoint),
    /// Delete breakpoint: db- <dr0-3>
    BreakpointDelete(BreakpointRegister),
    /// Attach debugger: da
    Attach,
    /// Detach debugger: dd
    Detach,
    /// Wait for the next debug event: dw
    Wait,
    /// Continue execution: dc [nh]
    Continue(ContinueStatus),
    /// Show registers of the delivered event: dr
    Registers,
    /// Help: ? or help
    Help,
    /// Quit: q or exit
    Quit,
    /// Unknown command
    Unknown(String),
}

/// Parse an address string (supports 0x prefix and decimal)
fn parse_address(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_register(s: &str) -> Option<BreakpointRegister> {
    match s.to_ascii_lowercase().as_str() {
        "dr0" | "0" => Some(BreakpointRegister::Dr0),
        "dr1" | "1" => Some(BreakpointRegister::Dr1),
        "dr2" | "2" => Some(BreakpointRegister::Dr2),
        "dr3" | "3" => Some(BreakpointRegister::Dr3),
        _ => None,
    }
}

fn parse_breakpoint(args: &[&str]) -> Option<HardwareBreakpoint> {
    let register = parse_register(args.first()?)?;
    let address = parse_address(args.get(1)?).ok()?;
    let trigger = match args.get(2).copied().unwrap_or("x") {
        "x" => BreakpointTrigger::Execute,
        "w" => BreakpointTrigger::Write,
        "rw" => BreakpointTrigger::Access,
        _ => return None,
    };
    let size = match args.get(3).copied().unwrap_or("1") {
        "1" => BreakpointSize::Size1,
        "2" => BreakpointSize::Size2,
        "4" => BreakpointSize::Size4,
        "8" => BreakpointSize::Size8,
        _ => return None,
    };
    Some(HardwareBreakpoint {
        register,
        address,
        trigger,
        size,
    })
}

/// Parse a command string into a structured command
pub fn parse_command(input: &str) -> ParsedCommand {
    let input = input.trim();
    let parts: Vec<&str> = input.split_whitespace().collect();
    let cmd = parts.first().copied().unwrap_or("");
    let args = parts.get(1..).unwrap_or(&[]);
    let unknown = || ParsedCommand::Unknown(input.to_string());

    match cmd {
        // Navigation
        "s" | "seek" => match args.first().map(|a| parse_address(a)) {
            Some(Ok(addr)) => ParsedCommand::Seek(addr),
            _ => unknown(),
        },

        // Processes
        "ps" => ParsedCommand::Processes,
        "o" | "open" => {
            let access = match args.get(1).copied().unwrap_or("rw") {
                "r" => ProcessAccess::Read,
                "w" => ProcessAccess::Write,
                "rw" => ProcessAccess::Full,
                _ => return unknown(),
            };
            match args.first().map(|a| parse_address(a)) {
                Some(Ok(pid)) => ParsedCommand::Open(pid, access),
                _ => unknown(),
            }
        }
        "oc" => ParsedCommand::CloseProcess,
        "dps" => ParsedCommand::Control(ControlAction::Suspend),
        "dpr" => ParsedCommand::Control(ControlAction::Resume),
        "dk" | "kill" => ParsedCommand::Control(ControlAction::Terminate),

        // Memory
        "dm" => ParsedCommand::MemoryMap,
        "dmm" => ParsedCommand::Modules,
        "px" => ParsedCommand::HexDump(args.first().and_then(|s| s.parse().ok()).unwrap_or(64)),
        "wx" => match args.first().map(hex::decode) {
            Some(Ok(bytes)) if !bytes.is_empty() => ParsedCommand::WriteHex(bytes),
            _ => unknown(),
        },

        // Disassembly
        "pd" => ParsedCommand::PrintDisasm(args.first().and_then(|s| s.parse().ok()).unwrap_or(10)),

        // Threads
        "dpt" => ParsedCommand::Threads,
        "dt" => match args.first().map(|a| parse_address(a)) {
            Some(Ok(raw)) => ParsedCommand::SelectThread(Handle::from_raw(raw)),
            _ => unknown(),
        },

        // Debug
        "db" => parse_breakpoint(args).map_or_else(unknown, ParsedCommand::BreakpointSet),
        "db-" => match args.first().and_then(|a| parse_register(a)) {
            Some(register) => ParsedCommand::BreakpointDelete(register),
            None => unknown(),
        },
        "da" | "attach" => ParsedCommand::Attach,
        "dd" | "detach" => ParsedCommand::Detach,
        "dw" | "wait" => ParsedCommand::Wait,
        "dc" | "continue" | "c" => match args.first().copied() {
            None | Some("h") => ParsedCommand::Continue(ContinueStatus::Handled),
            Some("nh") => ParsedCommand::Continue(ContinueStatus::NotHandled),
            Some(_) => unknown(),
        },
        "dr" | "regs" => ParsedCommand::Registers,

        // Help
        "?" | "help" => ParsedCommand::Help,

        // Quit
        "q" | "quit" | "exit" => ParsedCommand::Quit,

        _ => unknown(),
    }
}

/// Hex dump rows of 16 bytes; addresses wrap at the top of the address space
fn dump_rows(base: u64, bytes: &[u8]) -> Vec<(u64, String)> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, row)| (base.wrapping_add((i * 16) as u64), hex::encode(row)))
        .collect()
}

/// Print the help message
fn print_help() {
    println!("{}", "pipeprobe Commands".bold().cyan());
    println!("{}", "═".repeat(50).cyan());

    println!("\n{}", "Processes:".bold().yellow());
    println!("  {}               List processes", "ps".green());
    println!("  {}  Open process (default rw)", "o <pid> [r|w|rw]".green());
    println!("  {}               Close process", "oc".green());
    println!("  {}     Suspend / resume / kill", "dps dpr dk".green());

    println!("\n{}", "Memory:".bold().yellow());
    println!("  {}         Seek to address", "s <addr>".green());
    println!("  {}               Show memory map", "dm".green());
    println!("  {}              Show modules", "dmm".green());
    println!("  {}           Hex dump n bytes", "px [n]".green());
    println!("  {}         Write bytes", "wx <hex>".green());
    println!("  {}           Disassemble n instructions", "pd [n]".green());

    println!("\n{}", "Debugging:".bold().yellow());
    println!("  {}              List threads", "dpt".green());
    println!("  {}      Select thread", "dt <handle>".green());
    println!("  {}  Set breakpoint", "db <dr> <addr> [x|w|rw] [size]".green());
    println!("  {}        Delete breakpoint", "db- <dr>".green());
    println!("  {}            Attach / detach", "da dd".green());
    println!("  {}               Wait for event", "dw".green());
    println!("  {}          Continue (handled / not handled)", "dc [nh]".green());
    println!("  {}               Show registers", "dr".green());

    println!("\n{}", "Other:".bold().yellow());
    println!("  {}                Show this help", "?".green());
    println!("  {}                Quit", "q".green());
}

/// REPL state around one session
struct Repl<S: Duplex> {
    session: Session<S>,
    prompt: ProbePrompt,
    thread: Option<Handle>,
}

impl<S: Duplex> Repl<S> {
    fn process(&self) -> Result<Handle> {
        self.prompt
            .process
            .ok_or_else(|| anyhow::anyhow!("no process open (use 'o <pid>')"))
    }

    fn thread(&self) -> Result<Handle> {
        self.thread
            .ok_or_else(|| anyhow::anyhow!("no thread selected (use 'dpt' / 'dt')"))
    }

    /// Execute a parsed command; `false` ends the REPL
    fn execute(&mut self, cmd: ParsedCommand) -> Result<bool> {
        match cmd {
            ParsedCommand::Seek(addr) => {
                self.prompt.current_address = addr;
            }
            ParsedCommand::Processes => {
                for entry in self.session.enumerate_processes()? {
                    let entry = entry?;
                    println!("{:>8}  {}", entry.id, entry.module_path);
                }
            }
            ParsedCommand::Open(pid, access) => {
                let handle = self.session.open_process(pid, access)?;
                println!("[*] Opened {} as {}", pid, handle.to_string().green());
                self.prompt.process = Some(handle);
                // Default to the first thread
                self.thread = self
                    .session
                    .enumerate_threads(handle)?
                    .next()
                    .transpose()?
                    .map(|t| t.handle);
            }
            ParsedCommand::CloseProcess => {
                self.session.close_process(self.process()?)?;
                self.prompt.process = None;
                self.thread = None;
            }
            ParsedCommand::Control(action) => {
                self.session.control_process(self.process()?, action)?;
                println!("[*] {}", action);
            }
            ParsedCommand::MemoryMap => {
                let process = self.process()?;
                let sections = self
                    .session
                    .enumerate_sections(process)?
                    .collect::<Result<Vec<_>, _>>()?;
                for s in sections {
                    println!(
                        "{:#018x} - {:#018x}  {}  {:<8} {:<8} {:<16} {}",
                        s.base_address.into_raw(),
                        s.base_address.into_raw().wrapping_add(s.size),
                        s.protection.to_string().yellow(),
                        s.section_type,
                        s.category,
                        s.name,
                        s.module_path.to_string().dimmed()
                    );
                }
            }
            ParsedCommand::Modules => {
                let process = self.process()?;
                for module in self.session.enumerate_modules(process)? {
                    let m = module?;
                    println!("{}  {:>#10x}  {}", m.base_address, m.size, m.path);
                }
            }
            ParsedCommand::Threads => {
                let process = self.process()?;
                for thread in self.session.enumerate_threads(process)? {
                    let t = thread?;
                    let marker = if Some(t.handle) == self.thread { "*" } else { " " };
                    println!("{} {}  tid {}", marker, t.handle, t.thread_id);
                }
            }
            ParsedCommand::SelectThread(handle) => {
                self.thread = Some(handle);
            }
            ParsedCommand::HexDump(len) => {
                let process = self.process()?;
                let base = self.prompt.current_address;
                let bytes = self.session.read_memory(process, base, len)?;
                for (address, row) in dump_rows(base, &bytes) {
                    println!("{}  {}", format!("{:#018x}", address).cyan(), row);
                }
            }
            ParsedCommand::WriteHex(bytes) => {
                let process = self.process()?;
                self.session
                    .write_memory(process, self.prompt.current_address, &bytes)?;
                println!("[*] Wrote {} bytes", bytes.len());
            }
            ParsedCommand::PrintDisasm(count) => {
                let process = self.process()?;
                let mut address = self.prompt.current_address;
                for _ in 0..count {
                    let bytes = self
                        .session
                        .read_up_to(process, address, MAX_INSTRUCTION_LENGTH)?;
                    let record = self.session.decode_instruction(&bytes, address)?;
                    if !record.is_valid() {
                        println!("{:#018x}  {}", address, record.mnemonic.to_string().red());
                        break;
                    }
                    println!(
                        "{:#018x}  {:<30}  {}",
                        address,
                        hex::encode(record.bytes()).dimmed(),
                        record.mnemonic
                    );
                    address = address.wrapping_add(record.length as u64);
                }
            }
            ParsedCommand::BreakpointSet(bp) => {
                let thread = self.thread()?;
                self.session.set_hardware_breakpoint(thread, bp)?;
                println!("[*] Breakpoint {} on thread {}", bp, thread);
            }
            ParsedCommand::BreakpointDelete(register) => {
                let thread = self.thread()?;
                self.session.clear_hardware_breakpoint(thread, register)?;
                println!("[*] {} cleared", register);
            }
            ParsedCommand::Attach => {
                self.session.attach_debugger(self.process()?)?;
                println!("[*] Attached");
            }
            ParsedCommand::Detach => {
                self.session.detach_debugger()?;
                println!("[*] Detached");
            }
            ParsedCommand::Wait => {
                let event = self.session.pull_debug_event()?;
                println!("{} {}", "[event]".bold().magenta(), event);
                if let DebugEventInfo::Exception(info) = event.info {
                    self.prompt.current_address = info.registers.instruction_pointer();
                    self.thread = Some(event.thread_id);
                }
            }
            ParsedCommand::Continue(status) => {
                self.session.continue_debug_event(status)?;
                println!("[*] Continued ({})", status);
            }
            ParsedCommand::Registers => match self.session.pending_event().map(|e| e.info) {
                Some(DebugEventInfo::Exception(info)) => {
                    for (name, value) in info.registers.named() {
                        println!("    {:<4}= {:#018x}", name.to_uppercase(), value);
                    }
                }
                _ => println!("    {}", "(no exception delivered)".dimmed()),
            },
            ParsedCommand::Help => {
                print_help();
            }
            ParsedCommand::Quit => {
                println!("[*] Shutting down...");
                return Ok(false);
            }
            ParsedCommand::Unknown(input) => {
                println!("{} Unknown command: '{}'", "[!]".red(), input);
                println!("    Type '?' for help");
            }
        }
        Ok(true)
    }
}

/// Run the CLI REPL over an open session
pub fn run_cli<S: Duplex>(session: Session<S>) -> Result<()> {
    let mut line_editor = Reedline::create();
    let arch = session.architecture();
    let mut repl = Repl {
        session,
        prompt: ProbePrompt::new(),
        thread: None,
    };

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        format!("║  pipeprobe ({}) - Type '?' for help, 'q' to quit{:>12}║", arch, "").cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    loop {
        repl.prompt.debug = repl.session.debug_state();
        let sig = line_editor.read_line(&repl.prompt)?;
        match sig {
            Signal::Success(buffer) => {
                let input = buffer.trim();
                if input.is_empty() {
                    continue;
                }

                match repl.execute(parse_command(input)) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("{} {}", "[!]".red(), e),
                }
                if repl.session.is_closed() {
                    println!("{} Session closed by provider", "[!]".red());
                    break;
                }
            }
            Signal::CtrlD | Signal::CtrlC => {
                println!("\n[*] Interrupted");
                break;
            }
        }
    }

    repl.session.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_navigation() {
        assert_eq!(parse_command("s 0x10000"), ParsedCommand::Seek(0x10000));
        assert_eq!(parse_command("s 42"), ParsedCommand::Seek(42));
        assert!(matches!(parse_command("s"), ParsedCommand::Unknown(_)));
        assert_eq!(parse_command("pd"), ParsedCommand::PrintDisasm(10));
        assert_eq!(parse_command("px 32"), ParsedCommand::HexDump(32));
    }

    #[test]
    fn test_parse_process_commands() {
        assert_eq!(
            parse_command("o 4321"),
            ParsedCommand::Open(4321, ProcessAccess::Full)
        );
        assert_eq!(
            parse_command("o 0x10e1 r"),
            ParsedCommand::Open(4321, ProcessAccess::Read)
        );
        assert_eq!(parse_command("dk"), ParsedCommand::Control(ControlAction::Terminate));
        assert_eq!(parse_command("wx 90cc"), ParsedCommand::WriteHex(vec![0x90, 0xcc]));
        assert!(matches!(parse_command("wx zz"), ParsedCommand::Unknown(_)));
    }

    #[test]
    fn test_dump_rows_wrap() {
        let rows = dump_rows(u64::MAX - 7, &[0xab; 20]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, u64::MAX - 7);
        assert_eq!(rows[1].0, 8);
        assert_eq!(rows[1].1, "abababab");
    }

    #[test]
    fn test_parse_breakpoints() {
        assert_eq!(
            parse_command("db dr0 0x10000"),
            ParsedCommand::BreakpointSet(HardwareBreakpoint {
                register: BreakpointRegister::Dr0,
                address: 0x10000,
                trigger: BreakpointTrigger::Execute,
                size: BreakpointSize::Size1,
            })
        );
        assert_eq!(
            parse_command("db 3 0x40000 w 8"),
            ParsedCommand::BreakpointSet(HardwareBreakpoint {
                register: BreakpointRegister::Dr3,
                address: 0x40000,
                trigger: BreakpointTrigger::Write,
                size: BreakpointSize::Size8,
            })
        );
        assert!(matches!(parse_command("db dr4 0x1"), ParsedCommand::Unknown(_)));
        assert_eq!(
            parse_command("db- dr1"),
            ParsedCommand::BreakpointDelete(BreakpointRegister::Dr1)
        );
        assert_eq!(
            parse_command("dc nh"),
            ParsedCommand::Continue(ContinueStatus::NotHandled)
        );
    }
}
