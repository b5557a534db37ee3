//! Position sizing.

use bx_core::error::{BxError, BxResult};
use bx_core::types::{ContractInfo, SizingMode, TradeSignal};
use tracing::debug;

/// Quantity for `signal` under `mode`, rounded down to the contract's
/// quantity precision and raised to the exchange minimum (quantity and
/// notional).
///
/// `equity` is only read in [`SizingMode::RiskPercent`].
pub fn size_position(
    signal: &TradeSignal,
    contract: &ContractInfo,
    mode: SizingMode,
    equity: f64,
) -> BxResult<f64> {
    let entry = signal.entry_price;
    if !(entry > 0.0 && entry.is_finite()) {
        return Err(BxError::Sizing(format!("invalid entry price {entry}")));
    }

    let raw = match mode {
        SizingMode::FixedNotional { notional } => {
            if !(notional > 0.0) {
                return Err(BxError::Sizing(format!("invalid notional {notional}")));
            }
            notional / entry
        }
        SizingMode::RiskPercent { percent } => {
            let distance = (entry - signal.stop_loss).abs();
            if !(distance > 0.0 && distance.is_finite()) {
                return Err(BxError::Sizing(format!(
                    "invalid stop distance (entry={entry}, stop={})",
                    signal.stop_loss
                )));
            }
            if !(equity > 0.0) {
                return Err(BxError::Sizing(format!("no equity to risk ({equity})")));
            }
            equity * percent / 100.0 / distance
        }
    };

    if !(raw > 0.0 && raw.is_finite()) {
        return Err(BxError::Sizing(format!("computed quantity {raw} is not positive")));
    }

    let mut qty = contract.floor_quantity(raw);
    if qty < contract.min_qty {
        debug!(
            "[sizing] {} qty {qty} below minimum {}, clamping",
            contract.symbol, contract.min_qty
        );
        qty = contract.min_qty;
    }
    if contract.min_notional > 0.0 && qty * entry < contract.min_notional {
        let step = 10f64.powi(-(contract.quantity_precision as i32));
        let needed = (contract.min_notional / entry / step - 1e-9).ceil() * step;
        debug!(
            "[sizing] {} notional {} below minimum {}, raising qty to {needed}",
            contract.symbol,
            qty * entry,
            contract.min_notional
        );
        qty = contract.floor_quantity(needed + step / 2.0);
    }
    if !(qty > 0.0) {
        return Err(BxError::Sizing(format!(
            "quantity rounds to zero for {} (raw {raw})",
            contract.symbol
        )));
    }
    Ok(qty)
}
