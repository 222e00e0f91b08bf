//! Inbound command grammar: parses line-oriented UTF-8 text into typed
//! [`Command`]s. Stateless — the bus itself holds no state; a parsed command
//! is handed to the caller to post onto the event loop at `High` priority.

use crate::core::errors::RejectReason;
use crate::core::ids::ClientOrderId;
use crate::core::types::{OrderFlags, OrderType, Side, TimeInForce};
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    Order(String),
    Orders,
    Account,
    Position(String),
    Positions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Order {
        side: Side,
        symbol: String,
        qty: Decimal,
        price: Decimal,
        client_order_id: Option<ClientOrderId>,
        order_type: OrderType,
        time_in_force: TimeInForce,
        flags: OrderFlags,
    },
    Cancel {
        client_order_id: String,
    },
    Query(QueryTarget),
}

/// Parse one command line. Unknown tokens and unknown `key=value` keys are
/// rejected rather than ignored, per the external interface contract.
pub fn parse_command(line: &str) -> Result<Command, RejectReason> {
    let line = line.trim();
    if line.is_empty() {
        return Err(RejectReason::ParseError);
    }
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(RejectReason::ParseError)?;

    match verb.to_uppercase().as_str() {
        "ORDER" => parse_order(tokens.collect::<Vec<_>>()),
        "CANCEL" => {
            let id = tokens.next().ok_or(RejectReason::ParseError)?;
            if tokens.next().is_some() {
                return Err(RejectReason::ParseError);
            }
            Ok(Command::Cancel {
                client_order_id: id.to_string(),
            })
        }
        "QUERY" => parse_query(tokens.collect::<Vec<_>>()),
        _ => Err(RejectReason::ParseError),
    }
}

fn parse_order(tokens: Vec<&str>) -> Result<Command, RejectReason> {
    if tokens.len() < 4 {
        return Err(RejectReason::ParseError);
    }
    let side = Side::from_str(tokens[0]).map_err(|_| RejectReason::ParseError)?;
    let symbol = tokens[1].to_string();
    let qty = Decimal::from_str(tokens[2]).map_err(|_| RejectReason::ParseError)?;
    let price = Decimal::from_str(tokens[3]).map_err(|_| RejectReason::ParseError)?;

    let mut client_order_id = None;
    let mut order_type = OrderType::Limit;
    let mut time_in_force = TimeInForce::Gtc;
    let mut flags = OrderFlags::default();

    for tok in &tokens[4..] {
        let (key, value) = tok.split_once('=').ok_or(RejectReason::ParseError)?;
        match key {
            "client_order_id" => {
                client_order_id =
                    Some(ClientOrderId::new(value).map_err(|_| RejectReason::ParseError)?);
            }
            "type" => {
                order_type = OrderType::from_str(value).map_err(|_| RejectReason::ParseError)?;
            }
            "tif" => {
                time_in_force =
                    TimeInForce::from_str(value).map_err(|_| RejectReason::ParseError)?;
            }
            "flags" => {
                for flag in value.split(',') {
                    match flag {
                        "reduce_only" => flags.reduce_only = true,
                        "post_only" => flags.post_only = true,
                        "" => {}
                        _ => return Err(RejectReason::ParseError),
                    }
                }
            }
            _ => return Err(RejectReason::ParseError),
        }
    }

    if qty <= Decimal::ZERO {
        return Err(RejectReason::ParseError);
    }
    if matches!(order_type, OrderType::Limit) && price <= Decimal::ZERO {
        return Err(RejectReason::ParseError);
    }

    Ok(Command::Order {
        side,
        symbol,
        qty,
        price,
        client_order_id,
        order_type,
        time_in_force,
        flags,
    })
}

fn parse_query(tokens: Vec<&str>) -> Result<Command, RejectReason> {
    let kind = tokens.first().ok_or(RejectReason::ParseError)?;
    let target = match kind.to_uppercase().as_str() {
        "ORDER" => {
            let id = tokens.get(1).ok_or(RejectReason::ParseError)?;
            QueryTarget::Order(id.to_string())
        }
        "ORDERS" => QueryTarget::Orders,
        "ACCOUNT" => QueryTarget::Account,
        "POSITION" => {
            let symbol = tokens.get(1).ok_or(RejectReason::ParseError)?;
            QueryTarget::Position(symbol.to_string())
        }
        "POSITIONS" => QueryTarget::Positions,
        _ => return Err(RejectReason::ParseError),
    };
    Ok(Command::Query(target))
}
