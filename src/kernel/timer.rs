use crate::defs::{Err, KResult};

// Programmable interval timer, channel 0, square-wave mode. The ISR
// bumps a 64-bit tick counter; uptime is derived from ticks and the
// programmed frequency.

const PIT_HZ: u32 = 1_193_180;

#[cfg(target_os = "none")]
const CHANNEL_0_DATA: u16 = 0x40;
#[cfg(target_os = "none")]
const MODE_COMMAND: u16 = 0x43;

// command bits: channel 0, lo/hi byte access, square wave generator
#[cfg(target_os = "none")]
const SELECT_CHANNEL_0: u8 = 0x0 << 6;
#[cfg(target_os = "none")]
const ACCESS_LO_HI: u8 = 0x3 << 4;
#[cfg(target_os = "none")]
const MODE_SQUARE_WAVE: u8 = 0x3 << 1;

// the PIT divides its 1.19 MHz base clock by a 16-bit reload value.
pub fn pit_divisor(freq_hz: u32) -> KResult<u16> {
    if freq_hz == 0 {
        return Err(Err::InvalidArgument);
    }
    let divisor = PIT_HZ / freq_hz;
    if divisor == 0 || divisor > 0xffff {
        return Err(Err::NotSupported);
    }
    Ok(divisor as u16)
}

#[cfg(target_os = "none")]
mod hw {
    use super::*;
    use crate::spinlock::Mutex;
    use crate::x86::outb;
    use core::sync::atomic::{AtomicU32, Ordering};

    pub static TICKS: Mutex<u64> = Mutex::new(0, "time");
    static FREQ_HZ: AtomicU32 = AtomicU32::new(0);

    pub fn init(freq_hz: u32) -> KResult<()> {
        let divisor = pit_divisor(freq_hz)?;
        FREQ_HZ.store(freq_hz, Ordering::Relaxed);
        unsafe {
            outb(MODE_COMMAND, SELECT_CHANNEL_0 | ACCESS_LO_HI | MODE_SQUARE_WAVE);
            outb(CHANNEL_0_DATA, (divisor & 0xff) as u8);
            outb(CHANNEL_0_DATA, (divisor >> 8) as u8);
        }
        Ok(())
    }

    // called from the timer ISR.
    pub fn tick() {
        let mut ticks = TICKS.lock();
        *ticks += 1;
    }

    pub fn ticks() -> u64 {
        *TICKS.lock()
    }

    pub fn uptime_msecs() -> u64 {
        let freq = FREQ_HZ.load(Ordering::Relaxed) as u64;
        if freq == 0 {
            return 0;
        }
        ticks() * 1000 / freq
    }
}

#[cfg(target_os = "none")]
pub use hw::{init, tick, ticks, uptime_msecs};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_for_common_rates() {
        assert_eq!(pit_divisor(1000).unwrap(), 1193);
        assert_eq!(pit_divisor(100).unwrap(), 11931);
        assert_eq!(pit_divisor(PIT_HZ).unwrap(), 1);
    }

    #[test]
    fn divisor_rejects_out_of_range() {
        // 18 Hz would need a divisor beyond the 16-bit reload register
        assert_eq!(pit_divisor(18), Err(Err::NotSupported));
        assert_eq!(pit_divisor(0), Err(Err::InvalidArgument));
        // faster than the base clock means a zero divisor
        assert_eq!(pit_divisor(PIT_HZ * 2), Err(Err::NotSupported));
    }
}
