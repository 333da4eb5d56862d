//! The shipped data files load and wire together.

use shared::ability::{AbilitySource, AbilitySystemComponent, ActivationEnv, AbilityNotification, DeathState};
use shared::attributes::{AttributeEvent, AttributeSetClass, GameplayAttribute};
use shared::config::ConsoleVariables;
use shared::game_data::GameData;
use shared::tags::{names, tag};
use shared::weapons::hitscan::{apply_pending_damage, PendingDamage};

fn data() -> GameData {
    GameData::load_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../assets/data"))
}

fn pawn(data: &GameData) -> AbilitySystemComponent {
    let mut asc = AbilitySystemComponent::default();
    let set = data.ability_sets.get_cached_item("AbilitySet_Pawn").unwrap();
    set.give_to_ability_system(
        &mut asc,
        None,
        AbilitySource::default(),
        &data.ability_set_sources(),
        &mut ActivationEnv::none(),
    );
    asc
}

fn hit(amount: f32) -> PendingDamage {
    PendingDamage {
        target: 2,
        damage: amount,
        hit_zone: None,
        distance: 10.0,
        cartridge_id: 1,
    }
}

#[test]
fn test_registries_load() {
    let data = data();
    assert_eq!(data.abilities.len(), 6);
    assert_eq!(data.effects.len(), 3);
    assert_eq!(data.ability_sets.len(), 4);
    assert_eq!(data.montages.len(), 2);
    assert_eq!(data.attachments.len(), 8);
    assert_eq!(data.equipment.len(), 2);
    assert_eq!(data.items.len(), 3);

    assert_eq!(data.equipment_for_item("ID_Rifle").map(|e| e.id.clone()), Some("rifle".to_string()));
    assert!(data.equipment_for_item("ID_Medkit").is_none());
    let rifle = data.equipment.get_cached_item("rifle").unwrap();
    assert!(rifle.is_weapon());
    for set in &rifle.ability_sets_to_grant {
        assert!(data.ability_sets.get_cached_item(set).is_some(), "missing ability set {set}");
    }
}

#[test]
fn test_shipped_cvars_are_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/cvars.ron");
    let cvars = ConsoleVariables::read(path).unwrap();
    assert_eq!(cvars, ConsoleVariables::default());
}

#[test]
fn test_pawn_set_grants_crouch_and_attributes() {
    let data = data();
    let mut asc = pawn(&data);
    assert_eq!(asc.specs().len(), 3);
    assert_eq!(asc.get_numeric_attribute(GameplayAttribute::Health), Some(100.0));
    // Already present; adding again keeps the one set
    asc.add_attribute_set(AttributeSetClass::Health);

    let crouch = tag(names::INPUT_TAG_CROUCH);
    asc.ability_input_tag_pressed(&crouch);
    asc.process_ability_input(false, &mut ActivationEnv::none());
    assert!(asc.has_matching_gameplay_tag(&tag(names::STATUS_CROUCHING)));

    asc.ability_input_tag_released(&crouch);
    asc.process_ability_input(false, &mut ActivationEnv::none());
    assert!(!asc.has_matching_gameplay_tag(&tag(names::STATUS_CROUCHING)));
}

#[test]
fn test_spawn_protection_then_death() {
    let data = data();
    let mut asc = pawn(&data);
    assert!(asc.has_matching_gameplay_tag(&tag(names::GAMEPLAY_DAMAGE_IMMUNITY)));

    apply_pending_damage(&mut asc, &hit(500.0), 1, 1);
    assert_eq!(asc.get_numeric_attribute(GameplayAttribute::Health), Some(100.0));

    asc.tick(2.5);
    assert!(!asc.has_matching_gameplay_tag(&tag(names::GAMEPLAY_DAMAGE_IMMUNITY)));
    asc.drain_notifications();

    apply_pending_damage(&mut asc, &hit(500.0), 1, 1);
    assert_eq!(asc.get_numeric_attribute(GameplayAttribute::Health), Some(0.0));

    let out_of_health = asc.drain_notifications().into_iter().find_map(|n| match n {
        AbilityNotification::Attribute(AttributeEvent::OutOfHealth { instigator, magnitude, .. }) => {
            Some((instigator, magnitude))
        }
        _ => None,
    });
    let (instigator, magnitude) = out_of_health.unwrap();
    assert_eq!(instigator, Some(1));

    assert_eq!(asc.handle_out_of_health(instigator, magnitude, &mut ActivationEnv::none()), 1);
    assert_eq!(asc.death_state(), DeathState::DeathStarted);
    // Already dying
    assert_eq!(asc.handle_out_of_health(instigator, magnitude, &mut ActivationEnv::none()), 0);
}
