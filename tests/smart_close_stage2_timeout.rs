//! S2 (spec §8): smart-close with stage-2 timeout. A pending sell occupies
//! the newest buy; the two oldest buys are stale past the configured
//! timeout and get swept even though one of them isn't profitable yet.

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;

use warrant_nexus::calendar::SimpleHkCalendar;
use warrant_nexus::order_recorder::{OrderRecorder, SelectSellableOrdersArgs};
use warrant_nexus::types::Direction;

#[test]
fn stage2_sweeps_stale_buys_past_timeout_excluding_occupied() {
    let recorder = OrderRecorder::new();
    let t = |h: u32, m: u32| Utc.with_ymd_and_hms(2026, 7, 28, h, m, 0).unwrap();

    recorder.record_local_buy("B1", "12345.HK", dec!(0.9), 100, true, t(9, 30));
    recorder.record_local_buy("B2", "12345.HK", dec!(1.2), 100, true, t(9, 31));
    recorder.record_local_buy("B3", "12345.HK", dec!(1.3), 100, true, t(9, 32));

    // PS1 occupies B3, so it must never be selected by a concurrent close.
    recorder.submit_sell_order("PS1", "12345.HK", Direction::Long, 100, vec!["B3".to_string()], t(9, 33));

    let calendar = SimpleHkCalendar::new();
    let selection = recorder.select_sellable_orders(SelectSellableOrdersArgs {
        symbol: "12345.HK",
        is_long: true,
        current_price: dec!(1.05),
        max_sell_quantity: 1000,
        smart_close_enabled: true,
        smart_close_timeout_minutes: Some(60),
        now: t(11, 40), // well past 60 trading minutes from B1/B2's fills
        trading_calendar: &calendar,
    });

    assert_eq!(selection.quantity, 200, "B1 (profitable) and B2 (stale) both selected");
    assert_eq!(selection.related_buy_order_ids, vec!["B1".to_string(), "B2".to_string()]);
    assert!(
        !selection.related_buy_order_ids.contains(&"B3".to_string()),
        "B3 is occupied by PS1 and must not be re-selected"
    );
}
