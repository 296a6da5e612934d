use super::error::FakeError;
use crate::hal::counter;

/// Security counter double with per-image storage and a record of
/// every update the code under test asked for.
pub struct FakeCounter {
    pub stored: [u32; 2],
    pub updates: Vec<(u8, u32)>,
    pub fail: bool,
}

impl FakeCounter {
    pub fn new() -> FakeCounter {
        Self::with_stored([0, 0])
    }

    pub fn with_stored(stored: [u32; 2]) -> FakeCounter {
        FakeCounter { stored, updates: Vec::new(), fail: false }
    }
}

impl Default for FakeCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl counter::SecurityCounter for FakeCounter {
    type Error = FakeError;

    fn get(&mut self, image_index: u8) -> Result<u32, Self::Error> {
        if self.fail {
            return Err(FakeError);
        }
        Ok(self.stored[usize::from(image_index)])
    }

    fn update(&mut self, image_index: u8, value: u32) -> Result<(), Self::Error> {
        if self.fail {
            return Err(FakeError);
        }
        assert!(
            value > self.stored[usize::from(image_index)],
            "counter updates must be strictly increasing"
        );
        self.stored[usize::from(image_index)] = value;
        self.updates.push((image_index, value));
        Ok(())
    }
}
