//! VGA text-mode console.
//!
//! Writes into the 80×25 text buffer at physical 0xB8000 (identity-mapped
//! inside the low region). Scrolls by copying rows up. The cursor lives
//! behind a lock so the log sink can be called from anywhere.

use tachyon_core::sync::SpinLock;

/// Identity-mapped base of the text buffer.
const VGA_BUFFER: usize = 0xB8000;
const COLS: usize = 80;
const ROWS: usize = 25;

/// Light grey on black.
const DEFAULT_ATTR: u8 = 0x07;

struct Cursor {
    row: usize,
    col: usize,
}

static CURSOR: SpinLock<Cursor> = SpinLock::new(Cursor { row: 0, col: 0 });

#[inline]
fn cell_ptr(row: usize, col: usize) -> *mut u16 {
    (VGA_BUFFER + 2 * (row * COLS + col)) as *mut u16
}

fn put_cell(row: usize, col: usize, byte: u8) {
    let value = u16::from(byte) | (u16::from(DEFAULT_ATTR) << 8);
    // SAFETY: row/col are bounded by ROWS/COLS; the buffer is mapped.
    unsafe { cell_ptr(row, col).write_volatile(value) };
}

fn scroll_up() {
    for row in 1..ROWS {
        for col in 0..COLS {
            // SAFETY: Both cells are inside the text buffer.
            unsafe {
                let value = cell_ptr(row, col).read_volatile();
                cell_ptr(row - 1, col).write_volatile(value);
            }
        }
    }
    for col in 0..COLS {
        put_cell(ROWS - 1, col, b' ');
    }
}

/// Blanks the whole screen and resets the cursor.
pub fn clear() {
    let mut cursor = CURSOR.lock();
    for row in 0..ROWS {
        for col in 0..COLS {
            put_cell(row, col, b' ');
        }
    }
    cursor.row = 0;
    cursor.col = 0;
}

/// Writes a string at the cursor, handling newline and scrolling.
pub fn write_str(s: &str) {
    let mut cursor = CURSOR.lock();
    for byte in s.bytes() {
        match byte {
            b'\n' => {
                cursor.col = 0;
                cursor.row += 1;
            }
            b'\r' => cursor.col = 0,
            _ => {
                put_cell(cursor.row, cursor.col, byte);
                cursor.col += 1;
                if cursor.col == COLS {
                    cursor.col = 0;
                    cursor.row += 1;
                }
            }
        }
        if cursor.row == ROWS {
            scroll_up();
            cursor.row = ROWS - 1;
        }
    }
}
