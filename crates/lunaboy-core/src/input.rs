const JOYPAD_IRQ: u8 = 0x10;

/// Joypad register (P1/0xFF00). Button state arrives from the frontend as a
/// single active-low byte: bits 0-3 are right/left/up/down, bits 4-7 are
/// A/B/Select/Start.
pub struct Input {
    /// Select bits written by the game (bit 4 = directions, bit 5 = actions,
    /// both active low).
    select: u8,
    directions: u8,
    actions: u8,
}

impl Input {
    pub fn new() -> Self {
        Self {
            select: 0x30,
            directions: 0x0F,
            actions: 0x0F,
        }
    }

    pub fn read(&self) -> u8 {
        let mut nibble = 0x0F;
        if self.select & 0x10 == 0 {
            nibble &= self.directions;
        }
        if self.select & 0x20 == 0 {
            nibble &= self.actions;
        }
        0xC0 | self.select | nibble
    }

    pub fn write(&mut self, val: u8) {
        self.select = val & 0x30;
    }

    /// Apply a fresh active-low button mask from the frontend, raising the
    /// joypad interrupt when a button in a currently selected group goes down.
    pub fn update_state(&mut self, state: u8, if_reg: &mut u8) {
        let directions = state & 0x0F;
        let actions = (state >> 4) & 0x0F;

        let mut pressed = 0u8;
        if self.select & 0x10 == 0 {
            pressed |= self.directions & !directions;
        }
        if self.select & 0x20 == 0 {
            pressed |= self.actions & !actions;
        }
        if pressed != 0 {
            *if_reg |= JOYPAD_IRQ;
        }

        self.directions = directions;
        self.actions = actions;
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_register_reads_high() {
        let input = Input::new();
        assert_eq!(input.read(), 0xFF);
    }

    #[test]
    fn selected_group_reads_active_low() {
        let mut input = Input::new();
        let mut if_reg = 0;
        input.write(0x20); // select directions
        input.update_state(0xFF & !0x01, &mut if_reg); // right pressed
        assert_eq!(input.read() & 0x0F, 0x0E);
        assert_eq!(if_reg & JOYPAD_IRQ, JOYPAD_IRQ);
    }

    #[test]
    fn unselected_press_raises_no_interrupt() {
        let mut input = Input::new();
        let mut if_reg = 0;
        input.write(0x30); // nothing selected
        input.update_state(0xFF & !0x10, &mut if_reg); // A pressed
        assert_eq!(if_reg, 0);
        assert_eq!(input.read(), 0xFF);
    }

    #[test]
    fn release_never_interrupts() {
        let mut input = Input::new();
        let mut if_reg = 0;
        input.write(0x10); // select actions
        input.update_state(0xFF & !0x80, &mut if_reg); // start down
        if_reg = 0;
        input.update_state(0xFF, &mut if_reg); // start up
        assert_eq!(if_reg, 0);
    }
}
