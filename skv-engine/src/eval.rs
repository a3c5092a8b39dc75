//! # Command Evaluation
//!
//! Executes keyspace commands against one shard's engine. Every evaluation
//! reports the keys it changed so the shard can publish key-change events.

use bytes::Bytes;
use skv_common::{parse_integer, ttl_from, Command, CommandKind, ExpiryUnit, Reply, SkvError};
use tracing::error;

use crate::engine::{KVEngine, TtlStatus};

/// Outcome of evaluating one command on one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub reply: Reply,
    /// Keys whose value or presence changed.
    pub changed: Vec<Bytes>,
}

impl Evaluation {
    fn read(reply: Reply) -> Self {
        Evaluation {
            reply,
            changed: Vec::new(),
        }
    }
}

/// Executes `cmd` against `engine`.
pub fn execute<E: KVEngine + ?Sized>(engine: &E, cmd: &Command) -> Evaluation {
    let name = cmd.lower_name();
    let result = match cmd.kind() {
        CommandKind::Get => eval_get(engine, cmd),
        CommandKind::Set => eval_set(engine, cmd),
        CommandKind::Del => eval_del(engine, cmd),
        CommandKind::Exists => eval_exists(engine, cmd),
        CommandKind::Expire => eval_expire(engine, cmd),
        CommandKind::Ttl => eval_ttl(engine, cmd),
        _ => Err(SkvError::UnknownCommand),
    };
    match result {
        Ok(evaluation) => evaluation,
        Err(err) => {
            if err.category() == skv_common::SkvErrorCategory::Server {
                error!(command = %name, code = err.code(), "engine failure");
            }
            Evaluation::read(Reply::error(err, &name))
        }
    }
}

fn arity(cmd: &Command, exact: usize) -> Result<(), SkvError> {
    if cmd.args().len() != exact {
        return Err(SkvError::WrongArity);
    }
    Ok(())
}

fn eval_get<E: KVEngine + ?Sized>(engine: &E, cmd: &Command) -> Result<Evaluation, SkvError> {
    arity(cmd, 1)?;
    let reply = match engine.get(&cmd.args()[0])? {
        Some(value) => Reply::Bulk(value),
        None => Reply::Nil,
    };
    Ok(Evaluation::read(reply))
}

fn eval_set<E: KVEngine + ?Sized>(engine: &E, cmd: &Command) -> Result<Evaluation, SkvError> {
    let args = cmd.args();
    if args.len() != 2 && args.len() != 4 {
        return Err(SkvError::WrongArity);
    }
    let ttl = if args.len() == 4 {
        let unit = ExpiryUnit::from_option(&args[2]).ok_or(SkvError::Syntax)?;
        Some(ttl_from(parse_integer(&args[3])?, unit)?)
    } else {
        None
    };
    engine.set(args[0].clone(), args[1].clone(), ttl)?;
    Ok(Evaluation {
        reply: Reply::ok(),
        changed: vec![args[0].clone()],
    })
}

fn eval_del<E: KVEngine + ?Sized>(engine: &E, cmd: &Command) -> Result<Evaluation, SkvError> {
    if cmd.args().is_empty() {
        return Err(SkvError::WrongArity);
    }
    let mut changed = Vec::new();
    for key in cmd.args() {
        if engine.delete(key)? {
            changed.push(key.clone());
        }
    }
    Ok(Evaluation {
        reply: Reply::Integer(changed.len() as i64),
        changed,
    })
}

fn eval_exists<E: KVEngine + ?Sized>(engine: &E, cmd: &Command) -> Result<Evaluation, SkvError> {
    if cmd.args().is_empty() {
        return Err(SkvError::WrongArity);
    }
    let mut count = 0;
    for key in cmd.args() {
        if engine.exists(key)? {
            count += 1;
        }
    }
    Ok(Evaluation::read(Reply::Integer(count)))
}

fn eval_expire<E: KVEngine + ?Sized>(engine: &E, cmd: &Command) -> Result<Evaluation, SkvError> {
    arity(cmd, 2)?;
    let key = &cmd.args()[0];
    let seconds = parse_integer(&cmd.args()[1])?;
    // Non-positive expiry deletes the key immediately.
    let applied = if seconds <= 0 {
        engine.delete(key)?
    } else {
        engine.expire(key, ttl_from(seconds, ExpiryUnit::Seconds)?)?
    };
    Ok(Evaluation {
        reply: Reply::Integer(applied as i64),
        changed: if applied { vec![key.clone()] } else { Vec::new() },
    })
}

fn eval_ttl<E: KVEngine + ?Sized>(engine: &E, cmd: &Command) -> Result<Evaluation, SkvError> {
    arity(cmd, 1)?;
    let reply = match engine.ttl(&cmd.args()[0])? {
        TtlStatus::Missing => Reply::Integer(-2),
        TtlStatus::NoExpiry => Reply::Integer(-1),
        TtlStatus::ExpiresIn(remaining) => {
            Reply::Integer(((remaining.as_millis() + 500) / 1000) as i64)
        }
    };
    Ok(Evaluation::read(reply))
}
