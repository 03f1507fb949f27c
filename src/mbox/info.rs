//! Read-only firmware queries: board identity, memory split, clocks, voltages,
//! temperature and power domains.

use crate::error::QpuResult;
use crate::mbox::device::VcioDevice;
use crate::mbox::message::{PropertyMessage, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub revision: u32,
    pub variant: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardInfo {
    pub model: u32,
    pub revision: u32,
    pub serial: u64,
    pub mac: [u8; 6],
}

/// Base address and size of the ARM and VideoCore memory partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySplit {
    pub arm_base: u32,
    pub arm_size: u32,
    pub gpu_base: u32,
    pub gpu_size: u32,
}

/// Temperatures in thousandths of a degree Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Temperature {
    pub current: u32,
    pub max: u32,
}

/// Clock rates in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockInfo {
    pub on: bool,
    pub present: bool,
    pub rate: u32,
    pub max: u32,
    pub min: u32,
    pub turbo: bool,
}

/// Voltages in microvolts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoltageInfo {
    pub current: u32,
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerState {
    pub on: bool,
    pub present: bool,
}

macro_rules! firmware_ids {
    ($name:ident { $($variant:ident = $id:expr => $label:expr),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $id),*
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),*];

            #[must_use]
            pub const fn id(self) -> u32 {
                self as u32
            }

            #[must_use]
            pub const fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),*
                }
            }
        }
    };
}

firmware_ids!(Clock {
    Emmc = 1 => "EMMC",
    Uart = 2 => "UART",
    Arm = 3 => "ARM",
    Core = 4 => "CORE",
    V3d = 5 => "V3D",
    H264 = 6 => "H264",
    Isp = 7 => "ISP",
    Sdram = 8 => "SDRAM",
    Pixel = 9 => "PIXEL",
    Pwm = 10 => "PWM",
    Hevc = 11 => "HEVC",
    Emmc2 = 12 => "EMMC2",
    M2mc = 13 => "M2MC",
    PixelBvb = 14 => "PIXELBVB",
});

firmware_ids!(Voltage {
    Core = 1 => "Core",
    SdramCore = 2 => "SDRAM-Core",
    SdramPhy = 3 => "SDRAM-Phy",
    SdramIo = 4 => "SDRAM-I/O",
});

firmware_ids!(PowerDomain {
    SdCard = 0 => "SDCARD",
    Uart0 = 1 => "UART0",
    Uart1 = 2 => "UART1",
    UsbHcd = 3 => "USBHCD",
    I2c0 = 4 => "I2C0",
    I2c1 = 5 => "I2C1",
    I2c2 = 6 => "I2C2",
    Spi = 7 => "SPI",
    Ccp2Tx = 8 => "CCP2TX",
});

/// Decodes the state word shared by power and clock queries.
const fn decode_state(word: u32) -> (bool, bool) {
    (word & 0x1 != 0, word & 0x2 == 0)
}

fn decode_board(msg: &PropertyMessage) -> BoardInfo {
    let mac_lo = msg.word(2, 0).to_le_bytes();
    let mac_hi = msg.word(2, 1).to_le_bytes();
    BoardInfo {
        model: msg.word(0, 0),
        revision: msg.word(1, 0),
        mac: [mac_lo[0], mac_lo[1], mac_lo[2], mac_lo[3], mac_hi[0], mac_hi[1]],
        serial: u64::from(msg.word(3, 0)) | (u64::from(msg.word(3, 1)) << 32),
    }
}

impl VcioDevice {
    pub fn firmware_version(&self) -> QpuResult<FirmwareVersion> {
        let mut msg = PropertyMessage::new()
            .with(Tag::GetFirmwareRevision, &[], 1)
            .with(Tag::GetFirmwareVariant, &[], 1);
        self.property(&mut msg)?;
        Ok(FirmwareVersion {
            revision: msg.word(0, 0),
            variant: msg.word(1, 0),
        })
    }

    pub fn board(&self) -> QpuResult<BoardInfo> {
        let mut msg = PropertyMessage::new()
            .with(Tag::GetBoardModel, &[], 2)
            .with(Tag::GetBoardRevision, &[], 2)
            .with(Tag::GetBoardMac, &[], 2)
            .with(Tag::GetBoardSerial, &[], 2);
        self.property(&mut msg)?;
        Ok(decode_board(&msg))
    }

    pub fn memory_split(&self) -> QpuResult<MemorySplit> {
        let mut msg = PropertyMessage::new()
            .with(Tag::GetArmMemory, &[], 2)
            .with(Tag::GetVcMemory, &[], 2);
        self.property(&mut msg)?;
        Ok(MemorySplit {
            arm_base: msg.word(0, 0),
            arm_size: msg.word(0, 1),
            gpu_base: msg.word(1, 0),
            gpu_size: msg.word(1, 1),
        })
    }

    pub fn temperature(&self) -> QpuResult<Temperature> {
        let mut msg = PropertyMessage::new()
            .with(Tag::GetTemperature, &[0], 2)
            .with(Tag::GetTemperatureMax, &[0], 2);
        self.property(&mut msg)?;
        Ok(Temperature {
            current: msg.word(0, 1),
            max: msg.word(1, 1),
        })
    }

    pub fn clock(&self, clock: Clock) -> QpuResult<ClockInfo> {
        let id = clock.id();
        let mut msg = PropertyMessage::new()
            .with(Tag::GetClockState, &[id], 2)
            .with(Tag::GetClockRate, &[id], 2)
            .with(Tag::GetClockMax, &[id], 2)
            .with(Tag::GetClockMin, &[id], 2)
            .with(Tag::GetClockTurbo, &[id], 2);
        self.property(&mut msg)?;
        let (on, present) = decode_state(msg.word(0, 1));
        Ok(ClockInfo {
            on,
            present,
            rate: msg.word(1, 1),
            max: msg.word(2, 1),
            min: msg.word(3, 1),
            turbo: msg.word(4, 1) & 0x1 != 0,
        })
    }

    pub fn voltage(&self, rail: Voltage) -> QpuResult<VoltageInfo> {
        let id = rail.id();
        let mut msg = PropertyMessage::new()
            .with(Tag::GetVoltage, &[id], 2)
            .with(Tag::GetVoltageMin, &[id], 2)
            .with(Tag::GetVoltageMax, &[id], 2);
        self.property(&mut msg)?;
        Ok(VoltageInfo {
            current: msg.word(0, 1),
            min: msg.word(1, 1),
            max: msg.word(2, 1),
        })
    }

    pub fn power(&self, domain: PowerDomain) -> QpuResult<PowerState> {
        let mut msg = PropertyMessage::single(Tag::GetPowerState, &[domain.id()], 2);
        self.property(&mut msg)?;
        let (on, present) = decode_state(msg.word(0, 1));
        Ok(PowerState { on, present })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bits() {
        assert_eq!(decode_state(0b01), (true, true));
        assert_eq!(decode_state(0b10), (false, false));
        assert_eq!(decode_state(0b11), (true, false));
    }

    #[test]
    fn board_words_decode() {
        let mut msg = PropertyMessage::new()
            .with(Tag::GetBoardModel, &[], 2)
            .with(Tag::GetBoardRevision, &[], 2)
            .with(Tag::GetBoardMac, &[], 2)
            .with(Tag::GetBoardSerial, &[], 2);
        let words = msg.seal();
        // value areas start after each 3-word tag header
        words[5] = 0x0;
        words[10] = 0xa020d3;
        words[15] = 0x3412_27b8;
        words[16] = 0x0000_7856;
        words[20] = 0xdead_beef;
        words[21] = 0x1;
        let board = decode_board(&msg);
        assert_eq!(board.revision, 0xa020d3);
        assert_eq!(board.mac, [0xb8, 0x27, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(board.serial, 0x1_dead_beef);
    }

    #[test]
    fn id_tables_are_complete() {
        assert_eq!(Clock::ALL.len(), 14);
        assert_eq!(Voltage::ALL.len(), 4);
        assert_eq!(PowerDomain::ALL.len(), 9);
        assert_eq!(Clock::V3d.id(), 5);
        assert_eq!(PowerDomain::SdCard.label(), "SDCARD");
    }
}
