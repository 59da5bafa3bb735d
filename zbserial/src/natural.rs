//! Natural ("alphanum") string ordering.
//!
//! Runs of ASCII digits compare by numeric value, everything else compares
//! byte-wise, so `ttyUSB2` sorts before `ttyUSB10`.

use std::cmp::Ordering;

/// Split off the leading run of bytes that share `is_digit` with the first byte.
fn take_run(s: &[u8]) -> (&[u8], &[u8]) {
    let digit = s.first().is_some_and(u8::is_ascii_digit);
    let end = s
        .iter()
        .position(|b| b.is_ascii_digit() != digit)
        .unwrap_or(s.len());
    s.split_at(end)
}

fn cmp_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let trim = |run: &[u8]| -> usize { run.iter().take_while(|&&b| b == b'0').count() };
    let (a, b) = (&a[trim(a)..], &b[trim(b)..]);
    // Equal length digit strings order lexically.
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Compare two strings in natural order.
///
/// Strings that are equal under natural ordering but differ byte-wise (for
/// example `port01` and `port1`) fall back to plain ordering, so the result is
/// a total order consistent with `==`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut x, mut y) = (a.as_bytes(), b.as_bytes());

    while !x.is_empty() && !y.is_empty() {
        let (run_x, rest_x) = take_run(x);
        let (run_y, rest_y) = take_run(y);

        let x_digit = run_x[0].is_ascii_digit();
        let y_digit = run_y[0].is_ascii_digit();

        let ord = if x_digit && y_digit {
            cmp_numeric(run_x, run_y)
        } else {
            run_x.cmp(run_y)
        };
        if ord != Ordering::Equal {
            return ord;
        }

        x = rest_x;
        y = rest_y;
    }

    x.len()
        .cmp(&y.len())
        .then_with(|| a.cmp(b))
}
