//! Tradier REST adapter.
//!
//! Each credential set is a single bearer token. One token can own several
//! accounts; the profile endpoint returns either one account object or an
//! array, and positions come back as `"null"`, one object, or an array.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use zeroize::Zeroizing;

use rsa_common::util::mask_string;
use rsa_common::BrokersConfig;

use super::{Broker, BrokerId, LoginContext};
use crate::order::OrderRequest;
use crate::reporter::Reporter;
use crate::session::{AccountRecord, BrokerSession, Holding, SubAccount};

/// Login handle stored on each Tradier sub-account.
pub struct TradierLogin {
    token: Zeroizing<String>,
}

impl TradierLogin {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Fault {
    fault: FaultBody,
}

#[derive(Debug, Deserialize)]
struct FaultBody {
    faultstring: String,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    profile: Profile,
}

#[derive(Debug, Deserialize)]
struct Profile {
    account: OneOrMany<ProfileAccount>,
}

#[derive(Debug, Deserialize)]
struct ProfileAccount {
    account_number: String,
    #[serde(rename = "type")]
    account_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    balances: Balances,
}

#[derive(Debug, Deserialize)]
struct Balances {
    total_equity: f64,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    positions: Positions,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Positions {
    Held { position: OneOrMany<Position> },
    #[allow(dead_code)] // "null" when the account has no positions
    Empty(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct Position {
    symbol: String,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    quotes: Quotes,
}

#[derive(Debug, Deserialize)]
struct Quotes {
    quote: Option<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    last: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order: Option<OrderStatus>,
    errors: Option<OrderErrors>,
}

#[derive(Debug, Deserialize)]
struct OrderStatus {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderErrors {
    error: OneOrMany<String>,
}

// ============================================================================
// Adapter
// ============================================================================

/// Tradier brokerage over its public REST API.
pub struct TradierBroker {
    base_url: String,
    client: reqwest::Client,
}

impl TradierBroker {
    pub fn new(config: &BrokersConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build Tradier HTTP client")?;
        Ok(Self {
            base_url: config.tradier_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        token: &str,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let request = self
            .client
            .get(format!("{}/{endpoint}", self.base_url))
            .query(query);
        self.send(token, endpoint, request).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        token: &str,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let request = self
            .client
            .post(format!("{}/{endpoint}", self.base_url))
            .form(form);
        self.send(token, endpoint, request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        token: &str,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .with_context(|| format!("Tradier request to {endpoint} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Tradier {endpoint} returned status {}", status.as_u16());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("Tradier {endpoint} returned invalid JSON"))?;
        if let Ok(fault) = serde_json::from_value::<Fault>(body.clone()) {
            bail!("Tradier {endpoint} fault: {}", fault.fault.faultstring);
        }
        serde_json::from_value(body)
            .with_context(|| format!("Unexpected Tradier {endpoint} response"))
    }

    async fn login(&self, key: &str, token: &str) -> Result<SubAccount> {
        let profile: ProfileResponse = self.get(token, "user/profile", &[]).await?;
        let accounts = profile.profile.account.into_vec();
        tracing::info!(broker = "tradier", key = %key, accounts = accounts.len(), "Tradier accounts found");

        let mut sub = SubAccount::new(key, TradierLogin::new(token));
        for account in accounts {
            let endpoint = format!("accounts/{}/balances", account.account_number);
            let balance = match self.get::<BalancesResponse>(token, &endpoint, &[]).await {
                Ok(b) => b.balances.total_equity,
                Err(e) => {
                    tracing::warn!(
                        broker = "tradier",
                        account = %mask_string(&account.account_number),
                        error = %e,
                        "Failed to fetch balance"
                    );
                    0.0
                }
            };
            let mut record = AccountRecord::new(account.account_number).with_balance(balance);
            record.account_type = account.account_type;
            sub.add_account(record);
        }
        Ok(sub)
    }

    async fn last_price(&self, token: &str, symbol: &str) -> Option<f64> {
        match self
            .get::<QuotesResponse>(
                token,
                "markets/quotes",
                &[("symbols", symbol), ("greeks", "false")],
            )
            .await
        {
            Ok(q) => q.quotes.quote.and_then(|q| q.last),
            Err(e) => {
                tracing::debug!(symbol = %symbol, error = %e, "No Tradier quote");
                None
            }
        }
    }

    async fn positions(&self, token: &str, account: &str) -> Result<Vec<Holding>> {
        let response: PositionsResponse = self
            .get(token, &format!("accounts/{account}/positions"), &[])
            .await?;
        let positions = match response.positions {
            Positions::Held { position } => position.into_vec(),
            Positions::Empty(_) => return Ok(Vec::new()),
        };

        let mut holdings = Vec::with_capacity(positions.len());
        for position in positions {
            let price = self.last_price(token, &position.symbol).await;
            holdings.push(Holding::new(position.symbol, position.quantity, price));
        }
        Ok(holdings)
    }

    async fn place_order(
        &self,
        token: &str,
        account: &str,
        order: &OrderRequest,
        symbol: &str,
        amount: f64,
    ) -> Result<String> {
        let form = [
            ("class", "equity".to_string()),
            ("symbol", symbol.to_string()),
            ("side", order.action().as_str().to_string()),
            ("quantity", amount.to_string()),
            ("type", "market".to_string()),
            ("duration", "day".to_string()),
        ];
        let response: OrderResponse = self
            .post(token, &format!("accounts/{account}/orders"), &form)
            .await?;

        if let Some(status) = response.order.and_then(|o| o.status) {
            return Ok(status);
        }
        match response.errors {
            Some(errors) => Err(anyhow!(errors.error.into_vec().join(". "))),
            None => Err(anyhow!("This order did not route")),
        }
    }
}

#[async_trait]
impl Broker for TradierBroker {
    fn id(&self) -> BrokerId {
        BrokerId::Tradier
    }

    async fn init(&self, ctx: &LoginContext) -> Result<Option<BrokerSession>> {
        if ctx.credentials.is_empty() {
            return Ok(None);
        }

        ctx.reporter.emit("Logging in to Tradier...");
        let mut session = BrokerSession::new(BrokerId::Tradier.display_name());
        for set in &ctx.credentials {
            let key = ctx.sub_account_key(set);
            let Some(token) = set.field(0) else {
                continue;
            };
            match self.login(&key, token).await {
                Ok(sub) => {
                    session.add_sub_account(sub);
                }
                Err(e) => {
                    tracing::warn!(broker = "tradier", key = %key, error = %e, "Login failed");
                    ctx.reporter.emit(format!("{key}: Error logging in: {e}"));
                }
            }
        }
        if session.logged_in_count() > 0 {
            ctx.reporter.emit("Logged in to Tradier!");
        }
        Ok(Some(session))
    }

    async fn holdings(&self, session: &mut BrokerSession, reporter: &Reporter) -> Result<()> {
        for sub in session.sub_accounts_mut() {
            let Some(login) = sub.handle::<TradierLogin>() else {
                bail!("{}: missing Tradier login handle", sub.key);
            };
            let token = login.token.clone();
            let key = sub.key.clone();
            for account in &mut sub.accounts {
                match self.positions(&token, &account.number).await {
                    Ok(holdings) => account.holdings = holdings,
                    Err(e) => reporter.emit(format!("{key}: Error getting holdings: {e}")),
                }
            }
        }
        Ok(())
    }

    async fn transact(
        &self,
        session: &mut BrokerSession,
        order: &OrderRequest,
        reporter: &Reporter,
    ) -> Result<()> {
        let amount = order
            .amount()
            .ok_or_else(|| anyhow!("Tradier transaction without an amount"))?;
        let action = order.action();

        for symbol in order.symbols() {
            for sub in session.sub_accounts() {
                reporter.emit(format!("{}: {action}ing {amount} of {symbol}", sub.key));
                let Some(login) = sub.handle::<TradierLogin>() else {
                    bail!("{}: missing Tradier login handle", sub.key);
                };

                for account in &sub.accounts {
                    let masked = mask_string(&account.number);
                    if order.is_fractional() {
                        reporter.emit(format!(
                            "Tradier account {masked} Error: Fractional share {amount} not supported"
                        ));
                        continue;
                    }
                    if order.dry_run() {
                        reporter.emit(format!(
                            "Tradier account {masked}: Running in DRY mode. Transaction would've been: {action} {amount} of {symbol}"
                        ));
                        continue;
                    }
                    match self
                        .place_order(&login.token, &account.number, order, symbol, amount)
                        .await
                    {
                        Ok(status) => reporter.emit(format!(
                            "Tradier account {masked}: {action} {amount} of {symbol}: {status}"
                        )),
                        Err(e) => reporter.emit(format!("Tradier account {masked} Error: {e}")),
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
