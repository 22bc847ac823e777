//! Guest console channels, rendered as kernel command-line arguments.
//!
//! | console | guest side          | host side                           |
//! |---------|---------------------|-------------------------------------|
//! | `con0`  | supervisor console  | control pipe in, duplicated stdout  |
//! | `con1`  | `/tty1`, the command| inherited stdin/stdout              |
//! | `con2`  | `/tty2`, the relay  | pipes to the host relay             |

use std::fmt;
use std::os::fd::RawFd;

/// One direction of a console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Channel {
    /// Nothing attached.
    Null,
    /// A host descriptor inherited by the kernel process.
    Fd(RawFd),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Fd(fd) => write!(f, "fd:{fd}"),
        }
    }
}

/// Input and output of one numbered console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Console {
    /// Host side the guest reads from.
    pub input: Channel,
    /// Host side the guest writes to.
    pub output: Channel,
}

impl Console {
    /// A console with nothing attached.
    pub const NULL: Self = Self {
        input: Channel::Null,
        output: Channel::Null,
    };

    /// `conN=` argument for this console.
    pub fn arg(&self, n: u8) -> String {
        if *self == Self::NULL {
            format!("con{n}=null")
        } else {
            format!("con{n}={},{}", self.input, self.output)
        }
    }

    /// Descriptors the kernel process must inherit.
    pub fn fds(&self) -> impl Iterator<Item = RawFd> {
        [self.input, self.output].into_iter().filter_map(|c| match c {
            Channel::Fd(fd) => Some(fd),
            Channel::Null => None,
        })
    }
}

/// Arguments silencing every console and serial line not listed, followed
/// by the listed ones.
pub fn args(consoles: &[Console]) -> Vec<String> {
    let mut args = vec!["con=null".to_owned(), "ssl=null".to_owned()];
    args.extend(
        consoles
            .iter()
            .zip(0u8..)
            .map(|(console, n)| console.arg(n)),
    );
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_channels() {
        let con0 = Console {
            input: Channel::Fd(5),
            output: Channel::Fd(6),
        };
        let con1 = Console {
            input: Channel::Null,
            output: Channel::Fd(1),
        };
        assert_eq!(
            args(&[con0, con1, Console::NULL]),
            ["con=null", "ssl=null", "con0=fd:5,fd:6", "con1=null,fd:1", "con2=null"]
        );
    }

    #[test]
    fn inherited_fds() {
        let con = Console {
            input: Channel::Fd(0),
            output: Channel::Fd(1),
        };
        assert_eq!(con.fds().collect::<Vec<_>>(), [0, 1]);
        assert_eq!(Console::NULL.fds().count(), 0);
    }
}
