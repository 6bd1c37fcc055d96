//! Target position strategy
//!
//! Moves each configured symbol towards a fixed net position with market
//! orders, counting quantity already working in open orders.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::core::{OrderIntent, Side, Symbol};
use crate::engine::state::AccountState;
use crate::strategies::traits::Strategy;

pub struct TargetPositionStrategy {
    targets: HashMap<Symbol, Decimal>,
    prices: HashMap<Symbol, Decimal>,
}

impl TargetPositionStrategy {
    pub fn new(targets: HashMap<Symbol, Decimal>, prices: HashMap<Symbol, Decimal>) -> Self {
        Self { targets, prices }
    }

    /// Same state version and symbol always give the same key
    fn client_id(symbol: &Symbol, version: u64) -> String {
        format!("tgt-{}-{}", symbol.as_str().to_lowercase(), version)
    }
}

impl Strategy for TargetPositionStrategy {
    fn name(&self) -> &str {
        "target_position"
    }

    fn decide(&self, state: &AccountState) -> Vec<OrderIntent> {
        let mut symbols: Vec<&Symbol> = self.targets.keys().collect();
        symbols.sort();

        symbols
            .into_iter()
            .filter_map(|symbol| {
                let target = self.targets[symbol];
                let working = state.net_position(symbol) + state.open_order_exposure(symbol);
                let delta = target - working;
                if delta.is_zero() {
                    return None;
                }
                let price = *self.prices.get(symbol)?;
                let side = if delta > Decimal::ZERO { Side::Buy } else { Side::Sell };
                Some(
                    OrderIntent::market(symbol.clone(), side, delta.abs())
                        .with_reference_price(price)
                        .with_client_id(Self::client_id(symbol, state.version)),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Order, Position};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn strategy() -> TargetPositionStrategy {
        TargetPositionStrategy::new(
            HashMap::from([(Symbol::new("BTCUSDT"), dec!(2)), (Symbol::new("ETHUSDT"), dec!(-1))]),
            HashMap::from([(Symbol::new("BTCUSDT"), dec!(100)), (Symbol::new("ETHUSDT"), dec!(10))]),
        )
    }

    #[test]
    fn trades_the_difference_with_stable_keys() {
        let mut state = AccountState::default();
        state.version = 4;
        let mut btc = Position::flat(Symbol::new("BTCUSDT"), Utc::now());
        btc.apply_fill(Side::Buy, dec!(0.5), dec!(100), Utc::now());
        state.positions.insert(btc.symbol.clone(), btc);

        let intents = strategy().decide(&state);
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].symbol, Symbol::new("BTCUSDT"));
        assert_eq!(intents[0].side, Side::Buy);
        assert_eq!(intents[0].quantity, dec!(1.5));
        assert_eq!(intents[0].client_id.as_str(), "tgt-btcusdt-4");
        assert_eq!(intents[1].side, Side::Sell);
        assert_eq!(intents[1].quantity, dec!(1));

        let again = strategy().decide(&state);
        assert_eq!(again[0].client_id, intents[0].client_id);
    }

    #[test]
    fn open_orders_count_towards_target() {
        let mut state = AccountState::default();
        let working = OrderIntent::market("BTCUSDT", Side::Buy, dec!(2));
        let order = Order::pending(&working, Utc::now());
        state.orders.insert(order.client_id.clone(), order);

        let intents = strategy().decide(&state);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].symbol, Symbol::new("ETHUSDT"));
    }
}
