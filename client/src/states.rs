//! Game state machine

use bevy::prelude::*;

/// Main game states
#[derive(States, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GameState {
    #[default]
    MainMenu,
    Connecting,
    Playing,
    /// Playing with the pause menu open; abilities see the game as paused.
    Paused,
}

/// True while a pawn is in the world.
pub fn in_game(state: Res<State<GameState>>) -> bool {
    matches!(state.get(), GameState::Playing | GameState::Paused)
}
