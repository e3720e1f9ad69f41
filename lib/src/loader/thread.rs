#[cfg(feature = "logging")]
use log::error;
use nom::IResult;

use crate::errors::Error;
use crate::macho::parser;
use crate::platform::{CPU_TYPE_X86, CPU_TYPE_X86_64};

/// The thread state follows `cmd` and `cmdsize` (a `thread_command`) and
/// the `flavor` and `count` fields.
const THREAD_STATE_OFFSET: usize = 16;

/// Returns the instruction pointer stored in a LC_UNIXTHREAD or LC_MAIN
/// command. `command` is the whole command, and `offset` its position in
/// the image.
pub(crate) fn entry_point(
    command: &[u8],
    offset: usize,
    cputype: u32,
) -> Result<u64, Error> {
    let thread_state: fn(&[u8]) -> IResult<&[u8], u64> = match cputype {
        CPU_TYPE_X86 => parser::x86_thread_state,
        CPU_TYPE_X86_64 => parser::x86_64_thread_state,
        _ => {
            #[cfg(feature = "logging")]
            error!("Unknown CPU type {:#x}", cputype);
            return Err(Error::UnsupportedArchitecture { cputype });
        }
    };

    command
        .get(THREAD_STATE_OFFSET..)
        .and_then(|state| thread_state(state).ok())
        .map(|(_, entry)| entry)
        .ok_or(Error::truncated(
            "thread state",
            (offset + THREAD_STATE_OFFSET) as u64,
            command.len().saturating_sub(THREAD_STATE_OFFSET) as u64,
        ))
}
