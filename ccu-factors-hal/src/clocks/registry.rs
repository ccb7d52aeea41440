//! Fixed capacity registry of clocks, addressable by name.
use super::ClockHw;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("clock {0} is already registered")]
    Duplicate(&'static str),
    #[error("clock registry is full")]
    Full,
}

pub struct ClockRegistry<'a, const N: usize> {
    clocks: heapless::Vec<&'a dyn ClockHw, N>,
}

impl<const N: usize> Default for ClockRegistry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> ClockRegistry<'a, N> {
    pub const fn new() -> Self {
        Self {
            clocks: heapless::Vec::new(),
        }
    }

    /// Names are unique inside one registry.
    pub fn add(&mut self, clock: &'a dyn ClockHw) -> Result<(), RegistryError> {
        if self.get(clock.name()).is_some() {
            return Err(RegistryError::Duplicate(clock.name()));
        }
        self.clocks.push(clock).map_err(|_| RegistryError::Full)?;
        log::debug!("clock {} added to registry", clock.name());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&'a dyn ClockHw> {
        self.clocks.iter().copied().find(|clock| clock.name() == name)
    }

    /// First parent of a clock which is part of this registry.
    pub fn parent(&self, clock: &dyn ClockHw) -> Option<&'a dyn ClockHw> {
        clock
            .parent_names()
            .iter()
            .find_map(|parent| self.get(parent))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a dyn ClockHw> + '_ {
        self.clocks.iter().copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.clocks.clear();
    }
}
