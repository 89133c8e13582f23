//! Order command parsing.
//!
//! ```text
//! holdings <brokers> [not <brokers>]
//! <buy|sell> <amount> <symbols> <brokers> [not <brokers>] [dry:false]
//! ```
//!
//! `<brokers>` is a comma list of broker names or nicknames, or one of the
//! group names `all`, `most`, `fast`, `day1`. Everything is case-insensitive.

use thiserror::Error;

use crate::broker::{BrokerGroup, BrokerId};
use crate::order::{Action, OrderError, OrderRequest};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("No command given")]
    Empty,

    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Missing {0}")]
    Missing(&'static str),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{0} is not a supported broker")]
    UnknownBroker(String),

    #[error("Unexpected argument: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Parse a whitespace-separated command line.
pub fn parse_command(input: &str) -> Result<OrderRequest, CommandError> {
    let args: Vec<&str> = input.split_whitespace().collect();
    parse_args(&args)
}

/// Parse pre-split arguments.
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<OrderRequest, CommandError> {
    let args: Vec<String> = args.iter().map(|a| a.as_ref().to_lowercase()).collect();
    let mut rest = args.iter().map(String::as_str);

    let action = rest.next().ok_or(CommandError::Empty)?;
    let mut order = match action {
        "holdings" => {
            let brokers = rest.next().ok_or(CommandError::Missing("brokers"))?;
            OrderRequest::holdings(parse_broker_set(brokers)?)
        }
        "buy" | "sell" => {
            let action = if action == "buy" { Action::Buy } else { Action::Sell };
            let amount = rest.next().ok_or(CommandError::Missing("amount"))?;
            let amount: f64 = amount
                .parse()
                .map_err(|_| CommandError::InvalidAmount(amount.to_string()))?;
            let symbols = rest.next().ok_or(CommandError::Missing("symbols"))?;
            let brokers = rest.next().ok_or(CommandError::Missing("brokers"))?;

            let mut order = OrderRequest::new(action);
            order.set_amount(amount);
            for symbol in symbols.split(',').filter(|s| !s.is_empty()) {
                order.add_symbol(symbol);
            }
            order.add_brokers(parse_broker_set(brokers)?);
            order
        }
        other => return Err(CommandError::UnsupportedAction(other.to_string())),
    };

    while let Some(arg) = rest.next() {
        match arg {
            "not" => {
                let excluded = rest.next().ok_or(CommandError::Missing("brokers after not"))?;
                for broker in parse_broker_set(excluded)? {
                    order.exclude(broker);
                }
            }
            "false" | "dry:false" if order.action().is_trade() => order.set_dry_run(false),
            "true" | "dry:true" if order.action().is_trade() => order.set_dry_run(true),
            other => return Err(CommandError::Unexpected(other.to_string())),
        }
    }

    order.validate_pre_login()?;
    Ok(order)
}

/// Resolve a broker set: a group name or a comma list of names and nicknames.
pub fn parse_broker_set(input: &str) -> Result<Vec<BrokerId>, CommandError> {
    if let Some(group) = BrokerGroup::from_name(input) {
        return Ok(group.expand());
    }

    let mut brokers = Vec::new();
    for name in input.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let broker =
            BrokerId::from_name(name).ok_or_else(|| CommandError::UnknownBroker(name.to_string()))?;
        if !brokers.contains(&broker) {
            brokers.push(broker);
        }
    }
    if brokers.is_empty() {
        return Err(CommandError::Missing("brokers"));
    }
    Ok(brokers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holdings_with_exclusion() {
        let order = parse_command("holdings all not vg,rh").unwrap();
        assert_eq!(order.action(), Action::Holdings);
        assert_eq!(order.brokers().len(), BrokerId::ALL.len());
        assert!(order.is_excluded(BrokerId::Vanguard));
        assert!(order.is_excluded(BrokerId::Robinhood));
        // exclusion is applied at dispatch time, not here
        assert!(order.brokers().contains(&BrokerId::Vanguard));
    }

    #[test]
    fn test_trade_defaults_to_dry_run() {
        let order = parse_command("buy 1 xyz tradier").unwrap();
        assert_eq!(order.action(), Action::Buy);
        assert_eq!(order.amount(), Some(1.0));
        assert_eq!(order.symbols(), ["XYZ".to_string()]);
        assert_eq!(order.brokers(), [BrokerId::Tradier]);
        assert!(order.dry_run());
    }

    #[test]
    fn test_trade_dry_false_variants() {
        for flag in ["false", "dry:false", "DRY:FALSE"] {
            let order = parse_command(&format!("sell 2 abc,def fid,public {flag}")).unwrap();
            assert!(!order.dry_run(), "{flag}");
            assert_eq!(order.symbols().len(), 2);
            assert_eq!(order.brokers(), [BrokerId::Fidelity, BrokerId::Public]);
        }
        assert!(parse_command("sell 2 abc public dry:true").unwrap().dry_run());
    }

    #[test]
    fn test_trade_with_exclusion_and_flag() {
        let order = parse_command("Buy 0.5 XYZ most not public false").unwrap();
        assert!(order.is_fractional());
        assert!(!order.dry_run());
        assert!(order.is_excluded(BrokerId::Public));
        assert!(!order.brokers().contains(&BrokerId::Vanguard));
    }

    #[test]
    fn test_group_expansion_is_deterministic() {
        assert_eq!(parse_broker_set("most").unwrap(), parse_broker_set("MOST").unwrap());
        let most = parse_broker_set("most").unwrap();
        let all = parse_broker_set("all").unwrap();
        let missing: Vec<_> = all.iter().filter(|b| !most.contains(b)).collect();
        assert_eq!(missing, vec![&BrokerId::Vanguard]);
    }

    #[test]
    fn test_case_does_not_change_the_order() {
        assert_eq!(
            parse_command("BUY 1 XYZ Tradier DRY:FALSE"),
            parse_command("buy 1 xyz tradier dry:false")
        );
        assert_ne!(
            parse_command("buy 1 xyz tradier"),
            parse_command("buy 1 xyz tradier false")
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse_command(""), Err(CommandError::Empty));
        assert_eq!(
            parse_command("short 1 xyz all"),
            Err(CommandError::UnsupportedAction("short".into()))
        );
        assert_eq!(
            parse_command("buy one xyz all"),
            Err(CommandError::InvalidAmount("one".into()))
        );
        assert_eq!(parse_command("buy 1 xyz"), Err(CommandError::Missing("brokers")));
        assert_eq!(
            parse_command("holdings tradier,nope"),
            Err(CommandError::UnknownBroker("nope".into()))
        );
        assert_eq!(
            parse_command("holdings all false"),
            Err(CommandError::Unexpected("false".into()))
        );
        assert_eq!(
            parse_command("buy 0 xyz all"),
            Err(CommandError::Order(OrderError::InvalidAmount(0.0)))
        );
    }

    #[test]
    fn test_duplicate_brokers_collapse() {
        assert_eq!(
            parse_broker_set("tradier,Tradier").unwrap(),
            vec![BrokerId::Tradier]
        );
    }
}
