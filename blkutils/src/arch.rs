use strum_macros::IntoStaticStr;

/// System architecture, as far as probe policy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub enum SystemArchitecture {
    #[strum(serialize = "amd64")]
    Amd64,

    #[strum(serialize = "arm64")]
    Aarch64,

    #[strum(serialize = "riscv64")]
    Riscv64,

    #[strum(serialize = "other")]
    Other,
}

impl SystemArchitecture {
    pub const fn current() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            SystemArchitecture::Amd64
        }

        #[cfg(target_arch = "aarch64")]
        {
            SystemArchitecture::Aarch64
        }

        #[cfg(target_arch = "riscv64")]
        {
            SystemArchitecture::Riscv64
        }

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "riscv64"
        )))]
        {
            SystemArchitecture::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_names() {
        assert_eq!(<&str>::from(SystemArchitecture::Amd64), "amd64");
        assert_eq!(<&str>::from(SystemArchitecture::Riscv64), "riscv64");
    }
}
