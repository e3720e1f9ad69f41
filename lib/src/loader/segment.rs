use bstr::ByteSlice;
#[cfg(feature = "logging")]
use log::{debug, error};

use crate::config::LoaderConfig;
use crate::errors::Error;
use crate::macho::{physical_address, Segment};
use crate::platform::BootContext;

/// Segments that the loader must remember while walking load commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    /// `__TEXT`, the kernel's primary text segment.
    Text,
    /// `__KLD`, the kernel's loader stub.
    Stub,
}

/// Where a segment was placed in physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub address: u64,
    pub size: u64,
    pub kind: Option<SegmentKind>,
}

impl Placement {
    /// Result for segments with no size in memory or no data in the file.
    /// Those segments are not loaded at all, not even zero-filled.
    pub const ABSENT: Placement =
        Placement { address: 0xffff_ffff, size: 0, kind: None };
}

/// Copies a segment to its physical address and zero-fills the part of
/// the segment that is not backed by file data.
///
/// The segment must fit entirely in the kernel window or in the hibernation
/// window, otherwise [`Error::KernelOverflow`] is returned before anything
/// is written. The segment is classified only after it was copied.
pub(crate) fn place_segment(
    ctx: &mut BootContext,
    config: &LoaderConfig,
    image: &[u8],
    segment: &Segment,
) -> Result<Placement, Error> {
    let address = physical_address(segment.vmaddr);
    let size = segment.vmsize;

    if size == 0 || segment.filesize == 0 {
        return Ok(Placement::ABSENT);
    }

    if !config.kernel_window.contains(address, size)
        && !config.hibernation_window.contains(address, size)
    {
        #[cfg(feature = "logging")]
        error!("Kernel overflows available space");

        return Err(Error::KernelOverflow {
            segment: segment.segname.to_string(),
            address,
            size,
        });
    }

    let copy_size = size.min(segment.filesize);

    let source = usize::try_from(segment.fileoff)
        .ok()
        .zip(usize::try_from(copy_size).ok())
        .and_then(|(start, len)| image.get(start..start.checked_add(len)?))
        .ok_or(Error::truncated("segment", segment.fileoff, copy_size))?;

    let destination = ctx.memory.slice_mut(address, size)?;
    let (file_backed, zero_filled) = destination.split_at_mut(source.len());

    file_backed.copy_from_slice(source);
    zero_filled.fill(0);

    // Prelinked kernels carry their own kernel extensions, the boot loader
    // must not load them separately. Recent kernels use names like
    // __PRELINK_TEXT and __PRELINK_INFO, older ones use __PRELINK.
    let kind = if ctx.load_kernel_drivers
        && segment.segname.starts_with_str("__PRELINK")
    {
        #[cfg(feature = "logging")]
        debug!("Setting: load_kernel_drivers to false");

        ctx.load_kernel_drivers = false;
        None
    } else if segment.segname.starts_with_str("__TEXT") {
        Some(SegmentKind::Text)
    } else if segment.segname.starts_with_str("__KLD") {
        Some(SegmentKind::Stub)
    } else {
        None
    };

    Ok(Placement { address, size, kind })
}
