//! Rewriting of a single method body.
//!
//! The original instructions are kept in order. Injected code is laid out
//! around them as [`Piece`]s: the prologue ahead of the first instruction, an
//! exit snippet ahead of every return and the catch-all handler after the
//! last instruction. Everything that refers to code offsets is then carried
//! over to the new layout.

use super::hooks::{self, HookMethod, HOOK_CLASS};
use super::strategy::{Injection, ProbeKind};
use super::RewriteError;
use crate::bytecode::{self, opcodes::*, Layout, Piece, Snippet};
use crate::classfile::attributes::{
    parse_line_numbers, parse_local_variables, parse_stack_map_table, write_line_numbers, write_local_variables,
    write_stack_map_table, CodeAttribute, ExceptionTableEntry, StackMapFrame, VerificationType,
};
use crate::classfile::descriptor::{FieldType, MethodDescriptor};
use crate::classfile::{ClassFile, ClassFileError, ConstantPool, RawAttribute, ACC_STATIC, STACK_MAP_VERSION};
use crate::trace::ParameterAttribute;
use tracing::{debug, trace};

const THROWABLE: &str = "java/lang/Throwable";

/// Extra operand stack the injected code needs above the original maximum.
const EXIT_STACK: u16 = 3;
/// Stack used by the prologue: handle, attribute name and a boxed value.
const PROLOGUE_STACK: u16 = 6;

/// How the exit snippets close the probe.
#[derive(Debug, Clone, Copy)]
enum Exit {
    /// `lload handle; sipush opcode; invokestatic exit`
    Handle { exit: u16 },
    /// `ldc_w probeId; lload handle; invokestatic exitFlyweight`
    Flyweight { exit: u16, probe_id: u16 },
}

impl Exit {
    fn snippet(&self, handle: u16, opcode: u8) -> Snippet {
        let mut s = Snippet::new();
        match *self {
            Exit::Handle { exit } => {
                s.lload(handle).sipush(opcode as i16).invokestatic(exit);
            }
            Exit::Flyweight { exit, probe_id } => {
                s.ldc_w(probe_id).lload(handle).invokestatic(exit);
            }
        }
        s
    }
}

/// The injected code for one method, before layout.
struct Plan {
    prologue: Vec<u8>,
    /// Parameter capture, covered by the catch-all handler.
    capture: Vec<u8>,
    exit: Option<Exit>,
    catch_all: bool,
    /// Slot of the probe handle, a long.
    handle: Option<u16>,
}

struct MethodShape {
    name: String,
    descriptor: MethodDescriptor,
    is_static: bool,
    is_constructor: bool,
}

fn add_hook(cp: &mut ConstantPool, hook: HookMethod) -> Result<u16, ClassFileError> {
    cp.add_methodref(HOOK_CLASS, hook.name, hook.descriptor)
}

fn pc16(pc: u32) -> Result<u16, RewriteError> {
    u16::try_from(pc).map_err(|_| RewriteError::ClassFile(ClassFileError::CodeTooLarge(pc as usize)))
}

/// Rewrites method `method_index` of `class` in place.
pub(crate) fn rewrite_method(class: &mut ClassFile, method_index: usize, injection: &Injection) -> Result<(), RewriteError> {
    let major_version = class.major_version;
    let this_class = class.name()?.to_string();

    let method = class.methods.get(method_index).ok_or(RewriteError::NoSuchMethod(method_index))?;
    let cp = &class.constant_pool;
    let name = method.name(cp)?.to_string();
    let descriptor = MethodDescriptor::parse(method.descriptor(cp)?)?;
    let (code_position, code_attribute) =
        method.find_attribute(cp, "Code").ok_or_else(|| RewriteError::MissingCode(name.clone()))?;
    let code = CodeAttribute::parse(&code_attribute.info)?;
    let mut code_attributes = Vec::with_capacity(code.attributes.len());
    for attr in &code.attributes {
        code_attributes.push((attr.name(cp)?.to_string(), attr.clone()));
    }
    let shape = MethodShape {
        is_static: method.has_flag(ACC_STATIC),
        is_constructor: name == "<init>",
        name,
        descriptor,
    };

    let cp = &mut class.constant_pool;
    let plan = plan_injection(cp, &shape, code.max_locals, injection)?;
    let insns = bytecode::decode(&code.code)?;

    let mut pieces = Vec::with_capacity(insns.len() + 8);
    let mut covered = Vec::with_capacity(insns.len() + 8);
    pieces.push(Piece::Detached(plan.prologue.clone()));
    covered.push(false);
    if !plan.capture.is_empty() {
        pieces.push(Piece::Detached(plan.capture.clone()));
        covered.push(true);
    }
    for (i, located) in insns.iter().enumerate() {
        let mut exits_here = false;
        if let (Some(exit), Some(handle)) = (plan.exit, plan.handle) {
            if located.insn.is_return() {
                pieces.push(Piece::Prefix(exit.snippet(handle, located.insn.opcode()).build()));
                covered.push(false);
                exits_here = true;
            }
        }
        // A return that already closed the probe must not reach the handler.
        pieces.push(Piece::Original(i));
        covered.push(!exits_here);
    }
    let handler_piece = match (plan.catch_all, plan.exit, plan.handle) {
        (true, Some(exit), Some(handle)) => {
            let mut handler = exit.snippet(handle, ATHROW);
            handler.op(ATHROW);
            pieces.push(Piece::Detached(handler.build()));
            covered.push(false);
            Some(pieces.len() - 1)
        }
        _ => None,
    };

    let layout = bytecode::assemble(&insns, code.code.len() as u32, &pieces)?;

    let mut exception_table = Vec::with_capacity(code.exception_table.len() + 4);
    for entry in &code.exception_table {
        exception_table.push(ExceptionTableEntry {
            start_pc: pc16(layout.label(entry.start_pc as u32)?)?,
            end_pc: pc16(layout.label(entry.end_pc as u32)?)?,
            handler_pc: pc16(layout.label(entry.handler_pc as u32)?)?,
            catch_type: entry.catch_type,
        });
    }
    let handler_pc = match handler_piece {
        Some(piece) => {
            let handler_pc = pc16(layout.piece_start(piece))?;
            for (start, end) in covered_ranges(&layout, &covered) {
                exception_table.push(ExceptionTableEntry {
                    start_pc: pc16(start)?,
                    end_pc: pc16(end)?,
                    handler_pc,
                    catch_type: 0,
                });
            }
            Some(handler_pc)
        }
        None => None,
    };

    let mut attributes = Vec::with_capacity(code_attributes.len() + 1);
    let mut has_frames = false;
    for (attr_name, attr) in code_attributes {
        let info = match attr_name.as_str() {
            "StackMapTable" => {
                has_frames = true;
                let frames = parse_stack_map_table(&attr.info)?;
                let initial = initial_locals(cp, &this_class, &shape)?;
                let mut relocated = relocate_frames(&frames, initial, &layout, plan.handle)?;
                if let Some(handler_pc) = handler_pc {
                    relocated.push(handler_frame(cp, handler_pc as u32, plan.handle)?);
                }
                encode_frames(&relocated)?
            }
            "LineNumberTable" => {
                let mut lines = parse_line_numbers(&attr.info)?;
                for line in &mut lines {
                    line.start_pc = pc16(layout.label(line.start_pc as u32)?)?;
                }
                write_line_numbers(&lines)
            }
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                let mut vars = parse_local_variables(&attr.info)?;
                for var in &mut vars {
                    let start = layout.label(var.start_pc as u32)?;
                    let end = layout.label(var.start_pc as u32 + var.length as u32)?;
                    var.start_pc = pc16(start)?;
                    var.length = pc16(end - start)?;
                }
                write_local_variables(&vars)
            }
            other => {
                debug!(method = %shape.name, attribute = other, "Dropping code attribute with stale offsets");
                continue;
            }
        };
        attributes.push(RawAttribute { name_index: attr.name_index, info });
    }
    if !has_frames && major_version >= STACK_MAP_VERSION {
        if let Some(handler_pc) = handler_pc {
            let frame = handler_frame(cp, handler_pc as u32, plan.handle)?;
            attributes.push(RawAttribute { name_index: cp.add_utf8("StackMapTable")?, info: encode_frames(&[frame])? });
        }
    }

    let (max_stack, max_locals) = match plan.handle {
        Some(handle) => (code.max_stack.saturating_add(EXIT_STACK).max(PROLOGUE_STACK), handle + 2),
        None => (code.max_stack, code.max_locals),
    };
    let rewritten = CodeAttribute { max_stack, max_locals, code: layout.code, exception_table, attributes };

    trace!(
        method = %shape.name,
        old_len = code.code.len(),
        new_len = rewritten.code.len(),
        "Rewrote method body"
    );
    class.methods[method_index].attributes[code_position].info = rewritten.to_bytes()?;
    Ok(())
}

fn plan_injection(
    cp: &mut ConstantPool,
    shape: &MethodShape,
    max_locals: u16,
    injection: &Injection,
) -> Result<Plan, RewriteError> {
    let (probe_id, kind, parameters) = match injection {
        Injection::IgnoreTransaction => {
            let ignore = add_hook(cp, hooks::IGNORE_TRANSACTION)?;
            return Ok(Plan {
                prologue: Snippet::new().invokestatic(ignore).build(),
                capture: Vec::new(),
                exit: None,
                catch_all: false,
                handle: None,
            });
        }
        Injection::Probe { probe_id, kind, parameters } => (*probe_id, *kind, parameters),
    };

    let handle = max_locals;
    if handle.checked_add(2).is_none() {
        return Err(RewriteError::TooManyLocals(shape.name.clone()));
    }
    let id_index = cp.add_integer(probe_id as i32)?;
    let enter = add_hook(cp, if kind == ProbeKind::Flyweight { hooks::ENTER_FLYWEIGHT } else { hooks::ENTER })?;
    let prologue = Snippet::new().ldc_w(id_index).invokestatic(enter).lstore(handle).build();
    let capture = capture_parameters(cp, shape, handle, parameters)?;

    let exit = match kind {
        ProbeKind::Traced => Some(Exit::Handle { exit: add_hook(cp, hooks::EXIT)? }),
        ProbeKind::Flyweight => Some(Exit::Flyweight { exit: add_hook(cp, hooks::EXIT_FLYWEIGHT)?, probe_id: id_index }),
        ProbeKind::Async => None,
    };
    // `this` may still be uninitialized anywhere in a constructor.
    let catch_all = exit.is_some() && !shape.is_constructor;

    Ok(Plan { prologue, capture, exit, catch_all, handle: Some(handle) })
}

/// `attribute(handle, name, value)` for every capturable parameter.
fn capture_parameters(
    cp: &mut ConstantPool,
    shape: &MethodShape,
    handle: u16,
    parameters: &[ParameterAttribute],
) -> Result<Vec<u8>, RewriteError> {
    if parameters.is_empty() {
        return Ok(Vec::new());
    }
    let attribute = add_hook(cp, hooks::ATTRIBUTE)?;
    let mut s = Snippet::new();
    for param in parameters {
        let (Some(ty), Some(slot)) = (
            shape.descriptor.params.get(param.index),
            shape.descriptor.arg_slot(param.index, shape.is_static),
        ) else {
            debug!(method = %shape.name, index = param.index, "Parameter index out of range, not captured");
            continue;
        };
        let boxing = match ty {
            FieldType::Array(_) => continue,
            FieldType::Object(_) => None,
            FieldType::Int => Some(("java/lang/Integer", "(I)Ljava/lang/Integer;")),
            FieldType::Short => Some(("java/lang/Short", "(S)Ljava/lang/Short;")),
            FieldType::Byte => Some(("java/lang/Byte", "(B)Ljava/lang/Byte;")),
            FieldType::Char => Some(("java/lang/Character", "(C)Ljava/lang/Character;")),
            FieldType::Boolean => Some(("java/lang/Boolean", "(Z)Ljava/lang/Boolean;")),
            FieldType::Long => Some(("java/lang/Long", "(J)Ljava/lang/Long;")),
            FieldType::Float => Some(("java/lang/Float", "(F)Ljava/lang/Float;")),
            FieldType::Double => Some(("java/lang/Double", "(D)Ljava/lang/Double;")),
        };
        let name = cp.add_string(&param.attribute_name)?;
        s.lload(handle).ldc_w(name);
        match ty {
            FieldType::Object(_) => s.load(ALOAD, ALOAD_0, slot),
            FieldType::Long => s.load(LLOAD, LLOAD_0, slot),
            FieldType::Float => s.load(FLOAD, FLOAD_0, slot),
            FieldType::Double => s.load(DLOAD, DLOAD_0, slot),
            _ => s.load(ILOAD, ILOAD_0, slot),
        };
        if let Some((owner, descriptor)) = boxing {
            let value_of = cp.add_methodref(owner, "valueOf", descriptor)?;
            s.invokestatic(value_of);
        }
        s.invokestatic(attribute);
    }
    Ok(s.build())
}

/// Ranges of covered pieces, merged where they touch.
fn covered_ranges(layout: &Layout, covered: &[bool]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut open: Option<u32> = None;
    for (piece, &is_covered) in covered.iter().enumerate() {
        match (is_covered, open) {
            (true, None) => open = Some(layout.piece_start(piece)),
            (false, Some(start)) => {
                let end = layout.piece_start(piece);
                if end > start {
                    ranges.push((start, end));
                }
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        let end = layout.piece_end(covered.len() - 1);
        if end > start {
            ranges.push((start, end));
        }
    }
    ranges
}

fn verification_type(cp: &mut ConstantPool, ty: &FieldType) -> Result<VerificationType, ClassFileError> {
    Ok(match ty {
        FieldType::Int | FieldType::Short | FieldType::Byte | FieldType::Char | FieldType::Boolean => {
            VerificationType::Integer
        }
        FieldType::Float => VerificationType::Float,
        FieldType::Long => VerificationType::Long,
        FieldType::Double => VerificationType::Double,
        FieldType::Object(name) | FieldType::Array(name) => VerificationType::Object(cp.add_class(name)?),
    })
}

/// Locals at method entry, the base the first frame is relative to.
fn initial_locals(cp: &mut ConstantPool, this_class: &str, shape: &MethodShape) -> Result<Vec<VerificationType>, ClassFileError> {
    let mut locals = Vec::with_capacity(shape.descriptor.params.len() + 1);
    if !shape.is_static {
        if shape.is_constructor && this_class != "java/lang/Object" {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(cp.add_class(this_class)?));
        }
    }
    for param in &shape.descriptor.params {
        locals.push(verification_type(cp, param)?);
    }
    Ok(locals)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    offset: u32,
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

/// Resolves compressed frames to absolute offsets and complete locals.
fn expand_frames(frames: &[StackMapFrame], initial: Vec<VerificationType>) -> Result<Vec<Frame>, ClassFileError> {
    let malformed = || ClassFileError::InvalidAttribute("StackMapTable");
    let mut out: Vec<Frame> = Vec::with_capacity(frames.len());
    let mut locals = initial;
    let mut previous: Option<u32> = None;

    for frame in frames {
        let offset = match previous {
            None => frame.offset_delta() as u32,
            Some(prev) => prev + frame.offset_delta() as u32 + 1,
        };
        let stack = match frame {
            StackMapFrame::Same { .. } => Vec::new(),
            StackMapFrame::SameLocals1StackItem { stack, .. } => vec![*stack],
            StackMapFrame::Chop { k, .. } => {
                let k = *k as usize;
                if k > locals.len() {
                    return Err(malformed());
                }
                locals.truncate(locals.len() - k);
                Vec::new()
            }
            StackMapFrame::Append { locals: added, .. } => {
                locals.extend(added.iter().copied());
                Vec::new()
            }
            StackMapFrame::Full { locals: full, stack, .. } => {
                locals = full.clone();
                stack.clone()
            }
        };
        out.push(Frame { offset, locals: locals.clone(), stack });
        previous = Some(offset);
    }
    Ok(out)
}

fn relocate_type(ty: VerificationType, layout: &Layout) -> Result<VerificationType, RewriteError> {
    Ok(match ty {
        VerificationType::Uninitialized(pc) => VerificationType::Uninitialized(pc16(layout.instruction(pc as u32)?)?),
        other => other,
    })
}

/// Places `Long` for the probe handle at slot `handle`, padding with `Top`.
fn with_handle(mut locals: Vec<VerificationType>, handle: u16) -> Vec<VerificationType> {
    let mut slots: u16 = locals.iter().map(VerificationType::slots).sum();
    while slots < handle {
        locals.push(VerificationType::Top);
        slots += 1;
    }
    locals.push(VerificationType::Long);
    locals
}

fn relocate_frames(
    frames: &[StackMapFrame],
    initial: Vec<VerificationType>,
    layout: &Layout,
    handle: Option<u16>,
) -> Result<Vec<Frame>, RewriteError> {
    let mut out = Vec::with_capacity(frames.len() + 1);
    for frame in expand_frames(frames, initial)? {
        let locals = frame
            .locals
            .into_iter()
            .map(|ty| relocate_type(ty, layout))
            .collect::<Result<Vec<_>, _>>()?;
        let stack = frame
            .stack
            .into_iter()
            .map(|ty| relocate_type(ty, layout))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(Frame {
            offset: layout.label(frame.offset)?,
            locals: match handle {
                Some(handle) => with_handle(locals, handle),
                None => locals,
            },
            stack,
        });
    }
    Ok(out)
}

/// Frame at the catch-all handler: only the handle is live.
fn handler_frame(cp: &mut ConstantPool, handler_pc: u32, handle: Option<u16>) -> Result<Frame, ClassFileError> {
    let handle = handle.ok_or(ClassFileError::InvalidAttribute("catch-all handler without a probe handle"))?;
    Ok(Frame {
        offset: handler_pc,
        locals: with_handle(Vec::new(), handle),
        stack: vec![VerificationType::Object(cp.add_class(THROWABLE)?)],
    })
}

/// Writes every frame as a full frame.
fn encode_frames(frames: &[Frame]) -> Result<Vec<u8>, RewriteError> {
    let mut encoded = Vec::with_capacity(frames.len());
    let mut previous: Option<u32> = None;
    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(prev) if frame.offset > prev => frame.offset - prev - 1,
            Some(_) => return Err(ClassFileError::InvalidAttribute("StackMapTable frames out of order").into()),
        };
        encoded.push(StackMapFrame::Full {
            offset_delta: pc16(delta)?,
            locals: frame.locals.clone(),
            stack: frame.stack.clone(),
        });
        previous = Some(frame.offset);
    }
    Ok(write_stack_map_table(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_compressed_frames() {
        let initial = vec![VerificationType::Integer];
        let frames = vec![
            StackMapFrame::Append { offset_delta: 4, locals: vec![VerificationType::Long] },
            StackMapFrame::SameLocals1StackItem { offset_delta: 2, stack: VerificationType::Null },
            StackMapFrame::Chop { offset_delta: 0, k: 1 },
        ];
        let expanded = expand_frames(&frames, initial).unwrap();
        assert_eq!(expanded[0].offset, 4);
        assert_eq!(expanded[0].locals, vec![VerificationType::Integer, VerificationType::Long]);
        assert_eq!(expanded[1].offset, 7);
        assert_eq!(expanded[1].stack, vec![VerificationType::Null]);
        assert_eq!(expanded[2].offset, 8);
        assert_eq!(expanded[2].locals, vec![VerificationType::Integer]);
    }

    #[test]
    fn chop_past_the_start_is_malformed() {
        let frames = vec![StackMapFrame::Chop { offset_delta: 0, k: 2 }];
        assert!(expand_frames(&frames, vec![VerificationType::Integer]).is_err());
    }

    #[test]
    fn handle_slot_is_padded_with_top() {
        let locals = with_handle(vec![VerificationType::Integer, VerificationType::Double], 5);
        assert_eq!(
            locals,
            vec![
                VerificationType::Integer,
                VerificationType::Double,
                VerificationType::Top,
                VerificationType::Top,
                VerificationType::Long,
            ]
        );
    }
}
