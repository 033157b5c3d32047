//! Money arithmetic for orders.
//!
//! Tax is computed in exactly one place. The cart page, checkout, payment
//! verification, and email copy all derive their figures from here so the
//! amounts a customer sees never drift between surfaces.

/// Ontario HST applied to every order.
pub const TAX_RATE: f64 = 0.13;

/// Tolerance for comparing client-supplied totals against recomputed ones.
const CENT_EPSILON: f64 = 0.005;

/// An order's derived amounts, all rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
}

/// Round a currency amount half-up to cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Convert a dollar amount to integer cents for the payment provider.
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// One line's extended price.
pub fn line_total(unit_price: f64, quantity: u32) -> f64 {
    round_cents(unit_price * f64::from(quantity))
}

/// Derive tax and total from a subtotal.
pub fn totals_from_subtotal(subtotal: f64) -> Totals {
    let subtotal = round_cents(subtotal);
    let tax = round_cents(subtotal * TAX_RATE);
    Totals {
        subtotal,
        tax,
        total: round_cents(subtotal + tax),
    }
}

/// Whether two currency amounts agree within half a cent.
pub fn amounts_match(a: f64, b: f64) -> bool {
    (a - b).abs() < CENT_EPSILON
}

// ===========================================================================
// Tests
// ===========================================================================
