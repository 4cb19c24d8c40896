//! Private binary plan format: one LEB128 size prefix, a
//! deduplicated string table, then per-command records. No stability
//! guarantees across versions — any parse failure should be treated by the
//! caller as "no cache, recompute", never as a hard error.

use pm_command::{Command, CommandKind};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("truncated plan file")]
    Truncated,
    #[error("unknown command-kind tag {0}")]
    UnknownKind(u8),
    #[error("string table index {0} out of range")]
    BadStringIndex(usize),
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, SerializeError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf.get(*pos).ok_or(SerializeError::Truncated)?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

fn intern(table: &mut Vec<String>, index: &mut HashMap<String, usize>, s: &str) -> usize {
    if let Some(&i) = index.get(s) {
        return i;
    }
    let i = table.len();
    table.push(s.to_string());
    index.insert(s.to_string(), i);
    i
}

fn kind_tag(kind: CommandKind) -> u8 {
    match kind {
        CommandKind::Generic => 0,
        CommandKind::Msvc => 1,
        CommandKind::Gnu => 2,
        CommandKind::Builtin => 3,
    }
}

fn kind_from_tag(tag: u8) -> Result<CommandKind, SerializeError> {
    match tag {
        0 => Ok(CommandKind::Generic),
        1 => Ok(CommandKind::Msvc),
        2 => Ok(CommandKind::Gnu),
        3 => Ok(CommandKind::Builtin),
        other => Err(SerializeError::UnknownKind(other)),
    }
}

fn write_string_list(record: &mut Vec<u8>, table: &mut Vec<String>, index: &mut HashMap<String, usize>, items: &[String]) {
    write_varint(record, items.len() as u64);
    for item in items {
        write_varint(record, intern(table, index, item) as u64);
    }
}

fn read_string_list(body: &[u8], pos: &mut usize, table: &[String]) -> Result<Vec<String>, SerializeError> {
    let n = read_varint(body, pos)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let idx = read_varint(body, pos)? as usize;
        out.push(table.get(idx).ok_or(SerializeError::BadStringIndex(idx))?.clone());
    }
    Ok(out)
}

fn write_path_list(record: &mut Vec<u8>, table: &mut Vec<String>, index: &mut HashMap<String, usize>, paths: &[PathBuf]) {
    write_varint(record, paths.len() as u64);
    for path in paths {
        write_varint(record, intern(table, index, &path.to_string_lossy()) as u64);
    }
}

fn read_path_list(body: &[u8], pos: &mut usize, table: &[String]) -> Result<Vec<PathBuf>, SerializeError> {
    Ok(read_string_list(body, pos, table)?.into_iter().map(PathBuf::from).collect())
}

fn write_opt_path(record: &mut Vec<u8>, table: &mut Vec<String>, index: &mut HashMap<String, usize>, path: &Option<PathBuf>) {
    match path {
        None => write_varint(record, 0),
        Some(p) => write_varint(record, (intern(table, index, &p.to_string_lossy()) + 1) as u64),
    }
}

fn read_opt_path(body: &[u8], pos: &mut usize, table: &[String]) -> Result<Option<PathBuf>, SerializeError> {
    let v = read_varint(body, pos)?;
    if v == 0 {
        Ok(None)
    } else {
        let idx = (v - 1) as usize;
        Ok(Some(PathBuf::from(table.get(idx).ok_or(SerializeError::BadStringIndex(idx))?)))
    }
}

/// Serialize every command's resolved (not lazy) argument vector, working
/// directory, environment, stdio redirection, and input/intermediate/output
/// sets into the private binary format.
pub fn serialize_plan(commands: &[Command]) -> Vec<u8> {
    let mut table: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut records: Vec<Vec<u8>> = Vec::new();

    for command in commands {
        let mut record = Vec::new();
        write_varint(&mut record, intern(&mut table, &mut index, &command.id) as u64);
        record.push(kind_tag(command.kind));
        write_varint(&mut record, intern(&mut table, &mut index, &command.program.to_string_lossy()) as u64);
        write_varint(&mut record, intern(&mut table, &mut index, &command.working_dir.to_string_lossy()) as u64);
        write_string_list(&mut record, &mut table, &mut index, &command.resolve_args());

        write_varint(&mut record, command.env.len() as u64);
        for (key, value) in &command.env {
            write_varint(&mut record, intern(&mut table, &mut index, key) as u64);
            write_varint(&mut record, intern(&mut table, &mut index, value) as u64);
        }

        write_opt_path(&mut record, &mut table, &mut index, &command.stdout_redirect);
        write_opt_path(&mut record, &mut table, &mut index, &command.stderr_redirect);
        write_string_list(&mut record, &mut table, &mut index, &command.dependency_ids);
        write_path_list(&mut record, &mut table, &mut index, &command.inputs);
        write_path_list(&mut record, &mut table, &mut index, &command.intermediates);
        write_path_list(&mut record, &mut table, &mut index, &command.outputs);

        records.push(record);
    }

    let mut body = Vec::new();
    write_varint(&mut body, table.len() as u64);
    for s in &table {
        let bytes = s.as_bytes();
        write_varint(&mut body, bytes.len() as u64);
        body.extend_from_slice(bytes);
    }
    write_varint(&mut body, records.len() as u64);
    for record in &records {
        body.extend_from_slice(record);
    }

    let mut out = Vec::new();
    write_varint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    out
}

/// Reconstruct commands from the binary format. Every field but the
/// deferred-action closures round-trips — those are prepare-time behavior,
/// not persisted state, and a deserialized command is assumed already
/// prepared.
pub fn deserialize_plan(bytes: &[u8]) -> Result<Vec<Command>, SerializeError> {
    let mut pos = 0;
    let body_len = read_varint(bytes, &mut pos)? as usize;
    let body = bytes.get(pos..pos + body_len).ok_or(SerializeError::Truncated)?;
    let mut bpos = 0;

    let string_count = read_varint(body, &mut bpos)?;
    let mut table = Vec::with_capacity(string_count as usize);
    for _ in 0..string_count {
        let len = read_varint(body, &mut bpos)? as usize;
        let raw = body.get(bpos..bpos + len).ok_or(SerializeError::Truncated)?;
        table.push(String::from_utf8_lossy(raw).to_string());
        bpos += len;
    }

    let record_count = read_varint(body, &mut bpos)?;
    let mut commands = Vec::with_capacity(record_count as usize);
    for _ in 0..record_count {
        let id_idx = read_varint(body, &mut bpos)? as usize;
        let id = table.get(id_idx).ok_or(SerializeError::BadStringIndex(id_idx))?.clone();

        let kind_byte = *body.get(bpos).ok_or(SerializeError::Truncated)?;
        bpos += 1;
        let kind = kind_from_tag(kind_byte)?;

        let program_idx = read_varint(body, &mut bpos)? as usize;
        let program = table.get(program_idx).ok_or(SerializeError::BadStringIndex(program_idx))?.clone();
        let wd_idx = read_varint(body, &mut bpos)? as usize;
        let working_dir = table.get(wd_idx).ok_or(SerializeError::BadStringIndex(wd_idx))?.clone();

        let mut command = Command::new(id, kind, program, working_dir);
        for arg in read_string_list(body, &mut bpos, &table)? {
            command.push_literal(arg);
        }

        let env_count = read_varint(body, &mut bpos)?;
        for _ in 0..env_count {
            let k_idx = read_varint(body, &mut bpos)? as usize;
            let v_idx = read_varint(body, &mut bpos)? as usize;
            let key = table.get(k_idx).ok_or(SerializeError::BadStringIndex(k_idx))?.clone();
            let value = table.get(v_idx).ok_or(SerializeError::BadStringIndex(v_idx))?.clone();
            command.env.insert(key, value);
        }

        command.stdout_redirect = read_opt_path(body, &mut bpos, &table)?;
        command.stderr_redirect = read_opt_path(body, &mut bpos, &table)?;
        command.dependency_ids = read_string_list(body, &mut bpos, &table)?;
        command.inputs = read_path_list(body, &mut bpos, &table)?;
        command.intermediates = read_path_list(body, &mut bpos, &table)?;
        command.outputs = read_path_list(body, &mut bpos, &table)?;

        commands.push(command);
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_command::CommandKind;

    #[test]
    fn round_trips_a_command_with_shared_strings() {
        let mut a = Command::new("compile-a", CommandKind::Gnu, "/usr/bin/cc", "/work");
        a.push_literal("-Iinclude");
        a.inputs.push(PathBuf::from("a.c"));
        a.outputs.push(PathBuf::from("a.o"));
        a.env.insert("CC".to_string(), "cc".to_string());

        let mut b = Command::new("compile-b", CommandKind::Gnu, "/usr/bin/cc", "/work");
        b.push_literal("-Iinclude");
        b.dependency_ids.push("compile-a".to_string());
        b.inputs.push(PathBuf::from("b.c"));
        b.outputs.push(PathBuf::from("b.o"));

        let bytes = serialize_plan(&[a, b]);
        let restored = deserialize_plan(&bytes).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].id, "compile-a");
        assert_eq!(restored[0].resolve_args(), vec!["-Iinclude".to_string()]);
        assert_eq!(restored[0].env.get("CC"), Some(&"cc".to_string()));
        assert_eq!(restored[1].dependency_ids, vec!["compile-a".to_string()]);
        assert_eq!(restored[1].inputs, vec![PathBuf::from("b.c")]);
    }

    #[test]
    fn truncated_input_errors_instead_of_panicking() {
        let mut a = Command::new("c", CommandKind::Generic, "/bin/tool", "/work");
        a.push_literal("-x");
        let bytes = serialize_plan(&[a]);
        let truncated = &bytes[..bytes.len() - 3];
        assert!(deserialize_plan(truncated).is_err());
    }
}
