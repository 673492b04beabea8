use std::ops::Range;

use itertools::Itertools;
use log::trace;
use serde::Serialize;

use super::{FrameMapping, FrameTranslator, Mfn, PAGE_SHIFT, PAGE_SIZE, Pfn};

/// Outcome of a contiguity check.
///
/// `contiguous` is true iff every adjacent pair of frames in the checked range
/// maps to adjacent machine frames. `checked` counts the frames that were
/// translated before the decision was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ContiguityResult {
    /// Whether the machine frames are gapless and increasing
    pub contiguous: bool,
    /// Number of frames translated
    pub checked: usize,
}

/// Checks whether `page_count` frames starting at `start` are machine contiguous.
///
/// Ranges of zero or one page are trivially contiguous.
pub fn is_contiguous<T: FrameTranslator + ?Sized>(
    translator: &T,
    start: Pfn,
    page_count: usize,
) -> bool {
    check_contiguous(translator, start, page_count).contiguous
}

/// Same predicate as [`is_contiguous`], additionally reporting how many
/// frames were translated. Stops at the first discontinuity.
pub fn check_contiguous<T: FrameTranslator + ?Sized>(
    translator: &T,
    start: Pfn,
    page_count: usize,
) -> ContiguityResult {
    if page_count == 0 {
        return ContiguityResult {
            contiguous: true,
            checked: 0,
        };
    }
    let mut prev = translator.physical_to_machine(start);
    for i in 1..page_count {
        let mfn = translator.physical_to_machine(start + i);
        if !mfn.follows(prev) {
            trace!(
                "{:?} -> {:?} breaks machine contiguity after {:?}",
                start + i,
                mfn,
                prev
            );
            return ContiguityResult {
                contiguous: false,
                checked: i + 1,
            };
        }
        prev = mfn;
    }
    ContiguityResult {
        contiguous: true,
        checked: page_count,
    }
}

/// Number of pages touched by `length` bytes starting `offset` bytes into the
/// first page.
pub fn pages_spanned(offset: usize, length: usize) -> usize {
    (offset + length).div_ceil(PAGE_SIZE)
}

/// Checks whether the pages backing a byte range are machine contiguous.
///
/// Unlike [`check_contiguous`], the range is given in bytes: `offset` into the
/// frame `start`, `length` bytes long.
pub fn check_range_contiguous<T: FrameTranslator + ?Sized>(
    translator: &T,
    start: Pfn,
    offset: usize,
    length: usize,
) -> ContiguityResult {
    let start = start + (offset >> PAGE_SHIFT);
    check_contiguous(translator, start, pages_spanned(offset % PAGE_SIZE, length))
}

/// Splits `count` frames starting at `start` into maximal machine-contiguous runs.
pub fn machine_runs<T: FrameTranslator + ?Sized>(
    translator: &T,
    start: Pfn,
    count: usize,
) -> Vec<Range<Mfn>> {
    let mut runs = vec![];
    if count == 0 {
        return runs;
    }
    let mut prev = translator.physical_to_machine(start);
    let mut run_start = prev;
    for i in 1..count {
        let mfn = translator.physical_to_machine(start + i);
        if !mfn.follows(prev) {
            runs.push(run_start..prev + 1);
            run_start = mfn;
        }
        prev = mfn;
    }
    runs.push(run_start..prev + 1);
    runs
}

/// Formats frame tables for diagnostics.
pub trait FormatFrames {
    /// Renders one line per frame, marking every frame that starts a new
    /// machine run.
    fn format_frames(&self) -> String;
}

impl FormatFrames for [FrameMapping] {
    fn format_frames(&self) -> String {
        self.iter()
            .enumerate()
            .map(|(i, row)| {
                let breaks = i > 0 && !row.mfn.follows(self[i - 1].mfn);
                format!(
                    "  - ({}) pfn = 0x{:x}, mfn = 0x{:x}{}",
                    row.index,
                    row.pfn,
                    row.mfn,
                    if breaks {
                        "   <- not machine contiguous"
                    } else {
                        ""
                    }
                )
            })
            .join("\n")
    }
}
