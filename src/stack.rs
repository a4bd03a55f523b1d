use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use rustc_demangle::demangle;
use serde::Serialize;

use crate::dwarf::{
    AttrValue, DwarfInfo, Unit, DW_ATE_ADDRESS, DW_ATE_BOOLEAN, DW_ATE_SIGNED, DW_ATE_UNSIGNED,
    DW_AT_BYTE_SIZE, DW_AT_ENCODING, DW_AT_LOCATION, DW_AT_TYPE, DW_TAG_BASE_TYPE,
    DW_TAG_CONST_TYPE, DW_TAG_FORMAL_PARAMETER, DW_TAG_POINTER_TYPE, DW_TAG_TYPEDEF,
    DW_TAG_VOLATILE_TYPE,
};
use crate::elf::STT_FUNC;
use crate::expr;
use crate::process::Target;
use crate::reader::{DwarfReader, MemSource};
use crate::unwind::{StackFrame, ThreadStack};
use crate::Options;

/// Text rendering of one thread's stack, one frame per line.
pub fn print_thread_text(
    w: &mut dyn Write,
    target: &Target,
    thread: &ThreadStack,
    options: &Options,
) -> Result<()> {
    writeln!(
        w,
        "thread: {:#x}, lwp: {}, type: {}",
        thread.tid, thread.lwp, thread.thread_type
    )?;
    for frame in &thread.frames {
        write!(w, "    ")?;
        if options.verbose {
            write!(w, "[ip={:016x}, cfa={:016x}] ", frame.ip, frame.cfa)?;
        }

        if target.sysent != 0 && frame.ip == target.sysent {
            writeln!(w, "(syscall)")?;
            continue;
        }

        let module = match target.find_module(frame.ip) {
            Some(module) => module,
            None => {
                writeln!(w, "no information for frame")?;
                continue;
            }
        };
        let obj_ip = frame.ip - module.reloc;
        let file_name = module.image.describe();
        let sigmsg = if frame.is_signal { "[signal handler]" } else { "" };

        let dwarf = module.debug_dwarf(&options.debug_dirs)?;
        match dwarf.function_at(obj_ip.wrapping_sub(1)).unwrap_or(None) {
            Some((unit, idx)) => {
                let mut name = dwarf
                    .entry_name(&unit, idx)
                    .unwrap_or(None)
                    .unwrap_or_default();
                if name.is_empty() {
                    // Anonymous DIE; fall back to the symbol table and
                    // mark the result as second-hand.
                    name = module
                        .image
                        .find_symbol_by_address(obj_ip.wrapping_sub(1), STT_FUNC)
                        .unwrap_or(None)
                        .map(|sym| demangle(&sym.name).to_string())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    name.push('%');
                }
                let low = unit.entry(idx).low_pc().unwrap_or(obj_ip);
                write!(w, "{name}{sigmsg}+{}(", obj_ip - low)?;
                if options.doargs {
                    write!(w, "{}", format_args_list(target, &dwarf, &unit, idx, frame))?;
                }
                write!(w, ")")?;
            }
            None => match module
                .image
                .find_symbol_by_address(obj_ip.wrapping_sub(1), STT_FUNC)
                .unwrap_or(None)
            {
                Some(sym) => write!(
                    w,
                    "{}{sigmsg}!+{}()",
                    demangle(&sym.name),
                    obj_ip - sym.value
                )?,
                None => write!(w, "unknown@{:x}{sigmsg}()", frame.ip)?,
            },
        }

        write!(w, " in {file_name}")?;
        if !options.nosrc {
            for (file, line) in dwarf
                .source_from_addr(obj_ip.wrapping_sub(1))
                .unwrap_or_default()
            {
                write!(w, " at {}/{}:{line}", file.directory, file.name)?;
            }
        }
        writeln!(w)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonFrame {
    ip: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    off: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<i64>,
}

#[derive(Serialize)]
struct JsonThread {
    ti_tid: u64,
    ti_type: i32,
    stack: Vec<JsonFrame>,
}

/// JSON rendering of one thread's stack.
pub fn print_thread_json(
    w: &mut dyn Write,
    target: &Target,
    thread: &ThreadStack,
    options: &Options,
) -> Result<()> {
    let mut stack = Vec::new();
    for frame in &thread.frames {
        let mut out = JsonFrame {
            ip: frame.ip,
            function: None,
            off: None,
            file: None,
            source: None,
            line: None,
        };
        if target.sysent != 0 && frame.ip == target.sysent {
            out.function = Some("(syscall)".to_string());
            stack.push(out);
            continue;
        }
        if let Some(module) = target.find_module(frame.ip) {
            let obj_ip = frame.ip - module.reloc;
            out.file = Some(module.image.describe());
            if let Ok(Some(sym)) = module
                .image
                .find_symbol_by_address(obj_ip.wrapping_sub(1), STT_FUNC)
            {
                out.off = Some(obj_ip - sym.value);
                out.function = Some(demangle(&sym.name).to_string());
            }
            if let Ok(dwarf) = module.debug_dwarf(&options.debug_dirs) {
                for (file, line) in dwarf
                    .source_from_addr(obj_ip.wrapping_sub(1))
                    .unwrap_or_default()
                {
                    out.source = Some(format!("{}/{}", file.directory, file.name));
                    out.line = Some(line);
                }
            }
        }
        stack.push(out);
    }
    let json = JsonThread {
        ti_tid: thread.tid,
        ti_type: thread.thread_type,
        stack,
    };
    serde_json::to_writer(&mut *w, &json)?;
    writeln!(w)?;
    Ok(())
}

/// `name=value` for each formal parameter of the frame's function.
/// Best effort: a parameter whose location or type can't be resolved
/// prints as its bare name.
fn format_args_list(
    target: &Target,
    dwarf: &Rc<DwarfInfo>,
    unit: &Rc<Unit>,
    func_idx: usize,
    frame: &StackFrame,
) -> String {
    let mut out = String::new();
    let mut sep = "";
    for &child in &unit.entry(func_idx).children {
        let entry = unit.entry(child);
        if entry.tag != DW_TAG_FORMAL_PARAMETER {
            continue;
        }
        let name = dwarf
            .entry_name(unit, child)
            .unwrap_or(None)
            .unwrap_or_else(|| "anon".to_string());
        out.push_str(sep);
        out.push_str(&name);
        sep = ", ";

        let location = match entry.attr(DW_AT_LOCATION).and_then(|v| v.as_block().ok()) {
            Some(block) => block.to_vec(),
            None => continue,
        };
        let src = Arc::new(MemSource::new("location", location.clone()));
        let mut r = DwarfReader::new(src, 0, location.len() as u64);
        let mut stack = Vec::new();
        let addr = match expr::eval(&mut r, &frame.regs, &mut stack, target.io()) {
            Ok(addr) => addr,
            Err(_) => continue,
        };
        if let Some(value) = format_value(target, dwarf, unit, entry.attr(DW_AT_TYPE), addr) {
            out.push('=');
            out.push_str(&value);
        }
    }
    out
}

/// Render the value at `addr` according to its type DIE: base types by
/// encoding and byte size, pointers as hex words.
fn format_value(
    target: &Target,
    dwarf: &Rc<DwarfInfo>,
    unit: &Rc<Unit>,
    type_attr: Option<&AttrValue>,
    addr: u64,
) -> Option<String> {
    if addr == 0 {
        return Some("(null)".to_string());
    }
    let (mut unit, mut idx) = dwarf.resolve_reference(unit, type_attr?).ok()??;
    // Strip typedef and qualifier wrappers.
    for _ in 0..16 {
        let entry = unit.entry(idx);
        if matches!(
            entry.tag,
            DW_TAG_TYPEDEF | DW_TAG_CONST_TYPE | DW_TAG_VOLATILE_TYPE
        ) {
            let next = dwarf
                .resolve_reference(&unit, entry.attr(DW_AT_TYPE)?)
                .ok()??;
            unit = next.0;
            idx = next.1;
        } else {
            break;
        }
    }

    let entry = unit.entry(idx);
    match entry.tag {
        DW_TAG_POINTER_TYPE => {
            let mut word = [0u8; 8];
            target.io().read_exact_at(addr, &mut word).ok()?;
            Some(format!("{:#x}", u64::from_le_bytes(word)))
        }
        DW_TAG_BASE_TYPE => {
            let size = entry.attr(DW_AT_BYTE_SIZE)?.as_udata().ok()? as usize;
            if size == 0 || size > 8 {
                return Some("unrepresentable".to_string());
            }
            let mut buf = [0u8; 8];
            target.io().read_exact_at(addr, &mut buf[..size]).ok()?;
            let raw = u64::from_le_bytes(buf);
            let encoding = entry.attr(DW_AT_ENCODING)?.as_udata().ok()?;
            Some(match encoding {
                DW_ATE_SIGNED => {
                    let shift = 64 - size as u32 * 8;
                    (((raw << shift) as i64) >> shift).to_string()
                }
                DW_ATE_UNSIGNED => raw.to_string(),
                DW_ATE_BOOLEAN => (raw != 0).to_string(),
                DW_ATE_ADDRESS => format!("{raw:#x}"),
                _ => format!("<unprintable encoding {encoding}>"),
            })
        }
        other => Some(format!("<unprintable type {other:#x}>")),
    }
}
