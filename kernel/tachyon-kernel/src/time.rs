//! Boot-relative time from a PIT-calibrated TSC.
//!
//! The PIT is only used once, at boot, to estimate the TSC frequency: run
//! the PIT in rate-generator mode, busy-wait a known interval, and count
//! how many TSC ticks passed. After that, all timekeeping is `rdtsc`
//! arithmetic.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::instructions::rdtsc;
use crate::arch::x86_64::Port;

/// Base frequency of the PIT in Hz.
const PIT_MAX_HZ: u64 = 1_193_182;
/// Reload divisor used during calibration.
const PIT_DIVISOR_HZ: u64 = 100;

const PIT_PORT_CHAN0: u16 = 0x40;
const PIT_PORT_CMD: u16 = 0x43;

/// Rate-generator operating mode.
const PIT_CMD_RATEGEN: u8 = 1 << 2;
/// Access mode: low byte then high byte.
const PIT_CMD_ACCESS_HILO: u8 = (1 << 4) | (1 << 5);

/// TSC value captured at calibration start.
static TSC_BASE: AtomicU64 = AtomicU64::new(0);
/// Estimated TSC frequency in Hz. Zero means "not calibrated yet".
static TSC_FREQ_HZ: AtomicU64 = AtomicU64::new(0);

fn pit_read_tick() -> u16 {
    let cmd = Port::<u8>::new(PIT_PORT_CMD);
    let chan0 = Port::<u8>::new(PIT_PORT_CHAN0);
    // SAFETY: Latching and reading channel 0 is the documented protocol.
    unsafe {
        cmd.write(0); // Latch channel 0.
        let lo = chan0.read() as u16;
        let hi = chan0.read() as u16;
        lo | (hi << 8)
    }
}

/// Busy-waits roughly `n` microseconds using the PIT down-counter.
fn pit_delay_us(n: u64) {
    let reload = PIT_MAX_HZ / PIT_DIVISOR_HZ;
    let mut rem_ticks = (n * PIT_MAX_HZ / 1_000_000) as i64;
    let mut prev = pit_read_tick() as u64;

    while rem_ticks > 1 {
        let cur = pit_read_tick() as u64;
        if cur > prev {
            // The down-counter wrapped to the reload value.
            rem_ticks -= (reload - (cur - prev)) as i64;
        } else {
            rem_ticks -= (prev - cur) as i64;
        }
        prev = cur;
    }
}

/// Calibrates the TSC against the PIT. Must run once, before the scheduler.
pub fn init() {
    assert!(TSC_FREQ_HZ.load(Ordering::Relaxed) == 0, "time already initialized");

    let cmd = Port::<u8>::new(PIT_PORT_CMD);
    let chan0 = Port::<u8>::new(PIT_PORT_CHAN0);
    let reload = PIT_MAX_HZ / PIT_DIVISOR_HZ;
    // SAFETY: Programming channel 0 to rate-generator mode.
    unsafe {
        cmd.write(PIT_CMD_RATEGEN | PIT_CMD_ACCESS_HILO);
        chan0.write((reload & 0xFF) as u8);
        chan0.write((reload >> 8) as u8);
    }

    let base = rdtsc();
    pit_delay_us(100_000); // 0.1 s
    let freq_est = (rdtsc() - base) * 10;

    crate::kinfo!("time: TSC frequency estimate {} Hz", freq_est);

    TSC_BASE.store(base, Ordering::Relaxed);
    TSC_FREQ_HZ.store(freq_est, Ordering::Release);
}

/// Milliseconds elapsed since calibration.
///
/// # Panics
///
/// Panics before [`init`] has run.
pub fn current_ms() -> u64 {
    let freq = TSC_FREQ_HZ.load(Ordering::Acquire);
    assert!(freq != 0, "time not initialized");
    let elapsed = rdtsc() - TSC_BASE.load(Ordering::Relaxed);
    // 128-bit intermediate so the multiply cannot overflow.
    ((elapsed as u128 * 1000) / freq as u128) as u64
}
