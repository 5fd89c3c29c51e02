// flags.rs
//
// Bit-set newtypes for modem status, wait events, holding reasons, line
// errors and purge requests. Values follow the serial-port conventions so
// they can be passed through unchanged by a device layer.

macro_rules! bit_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident($repr:ty) {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl std::ops::BitXor for $name {
            type Output = Self;
            fn bitxor(self, rhs: Self) -> Self {
                Self(self.0 ^ rhs.0)
            }
        }

        impl std::ops::Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                Self(!self.0)
            }
        }
    };
}

bit_set! {
    /// Modem status register bits (high nibble) as seen by an endpoint.
    pub struct ModemStatus(u8) {
        const CTS = 0x10;
        const DSR = 0x20;
        const RING = 0x40;
        /// Carrier detect.
        const RLSD = 0x80;
    }
}

bit_set! {
    /// Events a waiter can ask for.
    pub struct EventMask(u32) {
        const RXCHAR = 0x0001;
        const RXFLAG = 0x0002;
        const TXEMPTY = 0x0004;
        const CTS = 0x0008;
        const DSR = 0x0010;
        const RLSD = 0x0020;
        const ERR = 0x0080;
        const RING = 0x0100;
        const RX80FULL = 0x0400;
    }
}

bit_set! {
    /// Reasons an endpoint is not allowed to transmit.
    pub struct Holding(u32) {
        const WAITING_FOR_CTS = 0x0001;
        const WAITING_FOR_DSR = 0x0002;
        const WAITING_FOR_DCD = 0x0004;
        const WAITING_FOR_XON = 0x0008;
    }
}

bit_set! {
    /// Accumulated line errors, cleared when read.
    pub struct LineErrors(u32) {
        const QUEUE_OVERRUN = 0x0008;
    }
}

bit_set! {
    pub struct PurgeFlags(u32) {
        const TXABORT = 0x0001;
        const RXABORT = 0x0002;
        const TXCLEAR = 0x0004;
        const RXCLEAR = 0x0008;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let mut status = ModemStatus::CTS | ModemStatus::DSR;
        assert!(status.contains(ModemStatus::CTS));
        assert!(!status.contains(ModemStatus::CTS | ModemStatus::RING));
        assert!(status.intersects(ModemStatus::DSR | ModemStatus::RING));

        status.remove(ModemStatus::CTS);
        assert_eq!(status, ModemStatus::DSR);

        status.set(ModemStatus::RLSD, true);
        assert_eq!(status.bits(), 0xA0);
        assert_eq!((status ^ ModemStatus::DSR), ModemStatus::RLSD);
    }

    #[test]
    fn test_holding_mask_excluding_xon() {
        let holding = Holding::WAITING_FOR_XON;
        assert!((holding & !Holding::WAITING_FOR_XON).is_empty());
        let holding = holding | Holding::WAITING_FOR_CTS;
        assert!(!(holding & !Holding::WAITING_FOR_XON).is_empty());
    }
}
