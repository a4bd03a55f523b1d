use std::path::PathBuf;

pub mod dwarf;
pub mod elf;
pub mod error;
pub mod expr;
pub mod frame;
pub mod line;
pub mod process;
pub mod reader;
pub mod stack;
pub mod unwind;

#[cfg(test)]
mod test_image;

/// Knobs the engine recognizes; the command line maps directly onto this.
#[derive(Clone, Debug)]
pub struct Options {
    /// Resolve and print argument values from DW_AT_location.
    pub doargs: bool,
    /// Suppress source file/line annotations.
    pub nosrc: bool,
    /// Print ip/cfa for every frame.
    pub verbose: bool,
    /// Cap on frames walked per thread.
    pub max_frames: usize,
    /// Search path for separate debug-info files.
    pub debug_dirs: Vec<PathBuf>,
    /// `(from, to)` prefix substitutions applied to shared-library paths.
    pub path_replacements: Vec<(String, String)>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            doargs: false,
            nosrc: false,
            verbose: false,
            max_frames: 1024,
            debug_dirs: vec![PathBuf::from("/usr/lib/debug")],
            path_replacements: Vec::new(),
        }
    }
}
