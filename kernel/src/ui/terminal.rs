//! Message-driven terminal.
//!
//! Owns a toplevel window, edits a command line, keeps a bounded history
//! and dispatches built-in commands. Executables found on the boot volume
//! are loaded through the ELF loader and run to completion; their address
//! space is torn down when they return.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::layer::{ACTIVE_LAYER, LAYER_MANAGER, LAYER_TASK_MAP};
use super::window::ToplevelWindow;
use crate::devices::keyboard::{KEYCODE_ARROW_DOWN, KEYCODE_ARROW_UP};
use crate::devices::pci;
use crate::elf::{self, ElfFile};
use crate::error::KernelResult;
use crate::filesys::{self, fat32::DirectoryEntry};
use crate::graphics::font::{write_ascii, CHAR_HEIGHT, CHAR_WIDTH};
use crate::graphics::{fill_rectangle, PixelColor, PixelFormat, Rectangle, Vector2D};
use crate::memory::page_map;
use crate::task::{self, make_layer_message, LayerOperation, Message, Task};

/// Nominal text grid driving the window size; the effective grid is
/// re-derived from the inner area.
const COLUMNS: i32 = 60;
const ROWS: i32 = 15;

const LINE_MAX: usize = 128;
const HISTORY_CAPACITY: usize = 8;

const FOREGROUND: PixelColor = PixelColor::WHITE;
const BACKGROUND: PixelColor = PixelColor::BLACK;

/// Fixed-capacity ring of past command lines, newest first.
pub struct CommandHistory {
    entries: [String; HISTORY_CAPACITY],
    head: usize,
    len: usize,
}

impl CommandHistory {
    pub fn new() -> Self {
        CommandHistory {
            entries: core::array::from_fn(|_| String::new()),
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        self.head = (self.head + HISTORY_CAPACITY - 1) % HISTORY_CAPACITY;
        self.entries[self.head] = line.to_string();
        self.len = (self.len + 1).min(HISTORY_CAPACITY);
    }

    /// 0 is the most recent line.
    pub fn get(&self, index: usize) -> Option<&str> {
        if index >= self.len {
            return None;
        }
        Some(&self.entries[(self.head + index) % HISTORY_CAPACITY])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Terminal {
    window: Arc<Mutex<ToplevelWindow>>,
    columns: i32,
    rows: i32,
    cursor: Vector2D,
    cursor_visible: bool,
    linebuf: [u8; LINE_MAX],
    linebuf_index: usize,
    history: CommandHistory,
    history_index: i32,
}

impl Terminal {
    pub fn new(pixel_format: PixelFormat) -> Self {
        let window = ToplevelWindow::new(
            COLUMNS * CHAR_WIDTH + 8 + ToplevelWindow::MARGIN_X,
            ROWS * CHAR_HEIGHT + 8 + ToplevelWindow::MARGIN_Y,
            pixel_format,
            "HelioTerm",
        );
        let inner = window.lock().inner_size();
        let mut terminal = Terminal {
            window,
            columns: (inner.x - 8) / CHAR_WIDTH,
            rows: (inner.y - 8) / CHAR_HEIGHT,
            cursor: Vector2D::new(0, 0),
            cursor_visible: false,
            linebuf: [0; LINE_MAX],
            linebuf_index: 0,
            history: CommandHistory::new(),
            history_index: -1,
        };
        {
            let mut tw = terminal.window.lock();
            let inner = tw.inner_size();
            fill_rectangle(&mut tw.inner_writer(), Vector2D::new(0, 0), inner, BACKGROUND);
        }
        terminal.print_str(">");
        terminal
    }

    /// Shared handle for the layer that composites this terminal.
    pub fn window(&self) -> Arc<Mutex<ToplevelWindow>> {
        Arc::clone(&self.window)
    }

    pub fn rows(&self) -> i32 {
        self.rows
    }

    pub fn columns(&self) -> i32 {
        self.columns
    }

    /// Current content of the line buffer.
    pub fn line(&self) -> &str {
        core::str::from_utf8(&self.linebuf[..self.linebuf_index]).unwrap_or("")
    }

    /// Cursor cell origin in window coordinates.
    fn calc_cursor_pos(&self) -> Vector2D {
        ToplevelWindow::TOP_LEFT_MARGIN
            + Vector2D::new(
                4 + CHAR_WIDTH * self.cursor.x,
                4 + CHAR_HEIGHT * self.cursor.y,
            )
    }

    fn draw_cursor(&mut self, visible: bool) {
        let color = if visible { FOREGROUND } else { BACKGROUND };
        let pos = self.calc_cursor_pos();
        let mut tw = self.window.lock();
        fill_rectangle(tw.window_mut(), pos, Vector2D::new(7, 15), color);
    }

    /// Toggles cursor visibility; returns the dirty cell rectangle in
    /// window coordinates.
    pub fn blink_cursor(&mut self) -> Rectangle {
        self.cursor_visible = !self.cursor_visible;
        self.draw_cursor(self.cursor_visible);
        Rectangle::new(self.calc_cursor_pos(), Vector2D::new(7, 15))
    }

    /// Handles one key event; returns the window area to redraw.
    pub fn input_key(&mut self, _modifier: u8, keycode: u8, ascii: u8) -> Rectangle {
        self.draw_cursor(false);

        let mut draw_area = Rectangle::new(
            self.calc_cursor_pos(),
            Vector2D::new(CHAR_WIDTH * 2, CHAR_HEIGHT),
        );

        if ascii == b'\n' {
            let line = self.line().to_string();
            if self.linebuf_index > 0 {
                self.history.push(&line);
            }
            self.linebuf_index = 0;
            self.history_index = -1;

            self.cursor.x = 0;
            if self.cursor.y < self.rows - 1 {
                self.cursor.y += 1;
            } else {
                self.scroll1();
            }
            self.execute_line(&line);
            self.print_str(">");
            let inner = self.window.lock().inner_size();
            draw_area = Rectangle::new(ToplevelWindow::TOP_LEFT_MARGIN, inner);
        } else if ascii == 0x08 {
            if self.cursor.x > 0 {
                self.cursor.x -= 1;
                let pos = self.calc_cursor_pos();
                {
                    let mut tw = self.window.lock();
                    fill_rectangle(
                        tw.window_mut(),
                        pos,
                        Vector2D::new(CHAR_WIDTH, CHAR_HEIGHT),
                        BACKGROUND,
                    );
                }
                draw_area.pos = pos;
                if self.linebuf_index > 0 {
                    self.linebuf_index -= 1;
                }
            }
        } else if ascii != 0 {
            if self.cursor.x < self.columns - 1 && self.linebuf_index < LINE_MAX - 1 {
                self.linebuf[self.linebuf_index] = ascii;
                self.linebuf_index += 1;
                let pos = self.calc_cursor_pos();
                {
                    let mut tw = self.window.lock();
                    write_ascii(tw.window_mut(), pos, ascii, FOREGROUND);
                }
                self.cursor.x += 1;
            }
        } else if keycode == KEYCODE_ARROW_DOWN {
            draw_area = self.history_up_down(-1);
        } else if keycode == KEYCODE_ARROW_UP {
            draw_area = self.history_up_down(1);
        }

        self.draw_cursor(true);
        draw_area
    }

    /// Shifts the text rows up by one and clears the bottom row.
    fn scroll1(&mut self) {
        let mut tw = self.window.lock();
        let move_src = Rectangle::new(
            Vector2D::new(4, 4 + CHAR_HEIGHT),
            Vector2D::new(CHAR_WIDTH * self.columns, CHAR_HEIGHT * (self.rows - 1)),
        );
        tw.move_inner_rect(Vector2D::new(4, 4), move_src);
        fill_rectangle(
            &mut tw.inner_writer(),
            Vector2D::new(4, 4 + CHAR_HEIGHT * self.cursor.y),
            Vector2D::new(CHAR_WIDTH * self.columns, CHAR_HEIGHT),
            BACKGROUND,
        );
    }

    fn newline(&mut self) {
        self.cursor.x = 0;
        if self.cursor.y < self.rows - 1 {
            self.cursor.y += 1;
        } else {
            self.scroll1();
        }
    }

    fn print_char(&mut self, c: u8) {
        if c == b'\n' {
            self.newline();
            return;
        }
        let pos = self.calc_cursor_pos();
        {
            let mut tw = self.window.lock();
            write_ascii(tw.window_mut(), pos, c, FOREGROUND);
        }
        if self.cursor.x == self.columns - 1 {
            self.newline();
        } else {
            self.cursor.x += 1;
        }
    }

    pub fn print_str(&mut self, s: &str) {
        self.draw_cursor(false);
        for c in s.bytes() {
            self.print_char(c);
        }
        self.draw_cursor(true);
    }

    fn history_up_down(&mut self, direction: i32) -> Rectangle {
        if direction == -1 && self.history_index >= 0 {
            self.history_index -= 1;
        } else if direction == 1 && self.history_index + 1 < self.history.len() as i32 {
            self.history_index += 1;
        }

        self.cursor.x = 1;
        let first_pos = self.calc_cursor_pos();
        let draw_area = Rectangle::new(
            first_pos,
            Vector2D::new(CHAR_WIDTH * (self.columns - 1), CHAR_HEIGHT),
        );
        {
            let mut tw = self.window.lock();
            fill_rectangle(tw.window_mut(), draw_area.pos, draw_area.size, BACKGROUND);
        }

        let history_line = if self.history_index >= 0 {
            self.history
                .get(self.history_index as usize)
                .unwrap_or("")
                .to_string()
        } else {
            String::new()
        };

        self.linebuf[..history_line.len()].copy_from_slice(history_line.as_bytes());
        self.linebuf_index = history_line.len();

        {
            let mut tw = self.window.lock();
            let mut pos = first_pos;
            for c in history_line.bytes() {
                write_ascii(tw.window_mut(), pos, c, FOREGROUND);
                pos.x += CHAR_WIDTH;
            }
        }
        self.cursor.x = self.linebuf_index as i32 + 1;
        draw_area
    }

    fn execute_line(&mut self, line: &str) {
        let (command, first_arg) = match line.find(' ') {
            Some(pos) => (&line[..pos], line[pos + 1..].trim_start()),
            None => (line, ""),
        };

        match command {
            "" => {}
            "echo" => {
                if !first_arg.is_empty() {
                    self.print_str(first_arg);
                }
                self.print_str("\n");
            }
            "clear" => {
                {
                    let mut tw = self.window.lock();
                    fill_rectangle(
                        &mut tw.inner_writer(),
                        Vector2D::new(4, 4),
                        Vector2D::new(CHAR_WIDTH * self.columns, CHAR_HEIGHT * self.rows),
                        BACKGROUND,
                    );
                }
                self.cursor.y = 0;
            }
            "lspci" => {
                for dev in pci::devices() {
                    let line = alloc::format!(
                        "{:02x}:{:02x}.{} vend={:04x} head={:02x} class={:02x}.{:02x}.{:02x}\n",
                        dev.bus,
                        dev.device,
                        dev.function,
                        dev.vendor_id,
                        dev.header_type,
                        dev.class_code.base,
                        dev.class_code.sub,
                        dev.class_code.interface,
                    );
                    self.print_str(&line);
                }
            }
            "ls" => match filesys::boot_volume() {
                None => self.print_str("no volume\n"),
                Some(volume) => {
                    let names: Vec<String> = volume
                        .dir_entries(0)
                        .filter(|e| !e.is_deleted() && !e.is_long_name())
                        .map(|e| e.display_name())
                        .collect();
                    for name in names {
                        self.print_str(&name);
                        self.print_str("\n");
                    }
                }
            },
            "cat" => match filesys::boot_volume() {
                None => self.print_str("no volume\n"),
                Some(volume) => match volume.find_file(first_arg, 0) {
                    None => {
                        let msg = alloc::format!("no such file: {}\n", first_arg);
                        self.print_str(&msg);
                    }
                    Some(entry) => {
                        let mut contents = alloc::vec![0u8; entry.file_size as usize];
                        let copied = volume.load_file(&mut contents, &entry);
                        self.draw_cursor(false);
                        for &byte in &contents[..copied] {
                            self.print_char(byte);
                        }
                        self.draw_cursor(true);
                    }
                },
            },
            _ => match filesys::boot_volume().and_then(|v| v.find_file(command, 0)) {
                None => {
                    let msg = alloc::format!("no such command: {}\n", command);
                    self.print_str(&msg);
                }
                Some(entry) => {
                    if let Err(err) = self.execute_file(&entry, command, first_arg) {
                        let msg = alloc::format!("failed to exec file: {:?}\n", err);
                        self.print_str(&msg);
                    }
                }
            },
        }
    }

    /// Loads an executable from the boot volume, runs it, prints its exit
    /// code and tears its address space down.
    fn execute_file(
        &mut self,
        entry: &DirectoryEntry,
        command: &str,
        first_arg: &str,
    ) -> KernelResult<()> {
        let volume = filesys::boot_volume().ok_or(crate::ErrorKind::InvalidFormat)?;
        let mut file_buf = alloc::vec![0u8; entry.file_size as usize];
        volume.load_file(&mut file_buf, entry);

        // Raw (non-ELF) images are not executed; jumping into arbitrary
        // bytes is not worth keeping as a convenience.
        let elf = ElfFile::parse(&file_buf)?;

        // argv strings must outlive the call below.
        let mut arg_storage: Vec<Vec<u8>> = Vec::new();
        let push_arg = |s: &str| {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            bytes
        };
        arg_storage.push(push_arg(command));
        for arg in first_arg.split_whitespace() {
            arg_storage.push(push_arg(arg));
        }
        let argv: Vec<*const u8> = arg_storage.iter().map(|a| a.as_ptr()).collect();

        let entry_addr = elf::load_elf(&elf)?;
        let func: elf::EntryPoint = unsafe { core::mem::transmute(entry_addr) };
        let ret = func(argv.len() as i32, argv.as_ptr());

        let msg = alloc::format!("app exited. ret = {}\n", ret);
        self.print_str(&msg);

        let first_addr = elf.first_load_address().ok_or(crate::ErrorKind::InvalidFormat)?;
        page_map::clean_page_maps(x86_64::VirtAddr::new(first_addr))?;
        Ok(())
    }
}

/// Main loop of a terminal task: create the terminal, register its layer,
/// arm the cursor-blink timer, then service keyboard and timer messages.
pub async fn terminal_task(task: Task, pixel_format: PixelFormat) {
    let mut terminal = Terminal::new(pixel_format);

    let layer_id = {
        let mut guard = LAYER_MANAGER.lock();
        let manager = guard.as_mut().expect("layer manager not initialized");
        let id = manager
            .new_layer()
            .set_window(terminal.window())
            .set_draggable(true)
            .id();
        manager.up_down(id, manager.stack_len() as i32);
        manager.move_to(id, Vector2D::new(100, 200));
        ACTIVE_LAYER.lock().activate(manager, id);
        id
    };
    LAYER_TASK_MAP.lock().insert(layer_id, task.id());

    task::timer::add_timer(task::timer::Timer {
        timeout: task::timer::TIMER_MANAGER.current_tick() + crate::constants::tasks::CURSOR_BLINK_TICKS,
        period: crate::constants::tasks::CURSOR_BLINK_TICKS,
        value: 1,
        dst_task: task.id(),
    });

    loop {
        match task.receive().await {
            Message::TimerTimeout { .. } => {
                let area = terminal.blink_cursor();
                let _ = task::send_message(
                    crate::constants::tasks::RENDER_TASK_ID,
                    make_layer_message(task.id(), layer_id, LayerOperation::DrawArea, area),
                );
            }
            Message::KeyPush {
                modifier,
                keycode,
                ascii,
            } => {
                let area = terminal.input_key(modifier, keycode, ascii);
                let _ = task::send_message(
                    crate::constants::tasks::RENDER_TASK_ID,
                    make_layer_message(task.id(), layer_id, LayerOperation::DrawArea, area),
                );
            }
            _ => {}
        }
    }
}
