use crate::clock::Clock;

const BLINK_HALF_PERIOD_MS: u64 = 50;
const HEARTBEAT_ON_MS: u64 = 100;
const HEARTBEAT_OFF_MS: u64 = 5_000;
const FAULT_FLASHES: u32 = 20;
const FAULT_HALF_PERIOD_MS: u64 = 100;

/// Single status LED.
///
/// The pulse is the only activity allowed to run outside the control loop;
/// backends without a timer may ignore it.
pub trait Indicator {
    fn set(&mut self, on: bool);

    fn start_pulse(&mut self, _period_ms: u64) {}

    fn stop_pulse(&mut self) {}
}

impl<I: Indicator + ?Sized> Indicator for &mut I {
    fn set(&mut self, on: bool) {
        (**self).set(on)
    }

    fn start_pulse(&mut self, period_ms: u64) {
        (**self).start_pulse(period_ms)
    }

    fn stop_pulse(&mut self) {
        (**self).stop_pulse()
    }
}

/// One fast blink, shown while waiting on the radio.
pub fn blink<I, C>(indicator: &mut I, clock: &C)
where
    I: Indicator + ?Sized,
    C: Clock + ?Sized,
{
    indicator.set(true);
    clock.sleep_ms(BLINK_HALF_PERIOD_MS);
    indicator.set(false);
    clock.sleep_ms(BLINK_HALF_PERIOD_MS);
}

/// Short flash followed by a long dark period, never sleeping past
/// `budget_ms`. Returns the time spent.
pub fn heartbeat<I, C>(indicator: &mut I, clock: &C, budget_ms: u64) -> u64
where
    I: Indicator + ?Sized,
    C: Clock + ?Sized,
{
    let started = clock.monotonic_ms();
    let on_ms = HEARTBEAT_ON_MS.min(budget_ms);

    indicator.set(true);
    clock.sleep_ms(on_ms);
    indicator.set(false);
    clock.sleep_ms(HEARTBEAT_OFF_MS.min(budget_ms - on_ms));

    clock.elapsed_since(started)
}

pub fn fault<I, C>(indicator: &mut I, clock: &C)
where
    I: Indicator + ?Sized,
    C: Clock + ?Sized,
{
    for _ in 0..FAULT_FLASHES {
        indicator.set(true);
        clock.sleep_ms(FAULT_HALF_PERIOD_MS);
        indicator.set(false);
        clock.sleep_ms(FAULT_HALF_PERIOD_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    #[derive(Default)]
    struct Recorder {
        levels: Vec<bool>,
    }

    impl Indicator for Recorder {
        fn set(&mut self, on: bool) {
            self.levels.push(on);
        }
    }

    #[test]
    fn blink_toggles_once() {
        let clock = ManualClock::new();
        let mut led = Recorder::default();

        blink(&mut led, &clock);

        assert_eq!(led.levels, vec![true, false]);
        assert_eq!(clock.monotonic_ms(), 100);
    }

    #[test]
    fn heartbeat_respects_budget() {
        let clock = ManualClock::new();
        let mut led = Recorder::default();

        assert_eq!(heartbeat(&mut led, &clock, 60_000), 5_100);
        assert_eq!(heartbeat(&mut led, &clock, 1_000), 1_000);
        assert_eq!(led.levels.last(), Some(&false));
    }

    #[test]
    fn fault_pattern_ends_dark() {
        let clock = ManualClock::new();
        let mut led = Recorder::default();

        fault(&mut led, &clock);

        assert_eq!(led.levels.len(), 40);
        assert_eq!(led.levels.last(), Some(&false));
    }
}
