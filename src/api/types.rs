//! Domain types tracked by the console.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::{MergeOutcome, PushEvent};

/// Transit lifecycle states as the backend reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitState {
  #[serde(rename = "pendiente")]
  Pendiente,
  #[serde(rename = "precintado")]
  Precintado,
  #[serde(rename = "en_ruta")]
  EnRuta,
  #[serde(rename = "listo")]
  Listo,
  #[serde(rename = "cerrado")]
  Cerrado,
}

/// A customs-sealed transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transit {
  pub id: String,
  /// Seal number on the cargo unit.
  pub precinto: String,
  pub estado: TransitState,
  pub origen: String,
  pub destino: String,
  #[serde(default)]
  pub truck_id: Option<String>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

/// Stock position at a depot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
  pub sku: String,
  pub descripcion: String,
  pub cantidad: i64,
  pub deposito: String,
}

/// Last reported truck position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truck {
  pub id: String,
  pub placa: String,
  pub lat: f64,
  pub lon: f64,
  #[serde(default)]
  pub reported_at: Option<DateTime<Utc>>,
}

/// Push payload describing a transit change.
///
/// Carries the full object in `transit`, or a state delta in `new_state`,
/// or neither (bare notification).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitUpdate {
  pub transit_id: String,
  #[serde(default)]
  pub new_state: Option<TransitState>,
  #[serde(default)]
  pub transit: Option<Transit>,
}

/// Apply a transit update to a held list in place.
///
/// Returns whether the update could be applied locally: a full object
/// replaces (or prepends) the entry; a state delta patches a known entry.
/// A delta for an unknown id or a bare notification cannot be applied.
pub fn apply_transit_update(list: &mut Vec<Transit>, update: &TransitUpdate) -> bool {
  match list.iter_mut().find(|t| t.id == update.transit_id) {
    Some(slot) => {
      if let Some(full) = &update.transit {
        *slot = full.clone();
        true
      } else if let Some(state) = update.new_state {
        slot.estado = state;
        true
      } else {
        false
      }
    }
    None => {
      if let Some(full) = &update.transit {
        list.insert(0, full.clone());
        true
      } else {
        false
      }
    }
  }
}

/// Merge policy wiring a transit-topic push event into a held transit list.
///
/// Events that can be applied locally merge with no network round trip;
/// anything else asks the resource to refetch.
pub fn merge_transit_event(
  event: &PushEvent,
  current: Option<&Vec<Transit>>,
) -> MergeOutcome<Vec<Transit>> {
  let update: TransitUpdate = match serde_json::from_value(event.payload.clone()) {
    Ok(u) => u,
    Err(_) => return MergeOutcome::Ignore,
  };

  match current {
    Some(list) => {
      let mut next = list.clone();
      if apply_transit_update(&mut next, &update) {
        MergeOutcome::Update(next)
      } else {
        MergeOutcome::Refetch
      }
    }
    None => MergeOutcome::Refetch,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn transit(id: &str, estado: TransitState) -> Transit {
    Transit {
      id: id.to_string(),
      precinto: format!("P-{}", id),
      estado,
      origen: "ASU".to_string(),
      destino: "CDE".to_string(),
      truck_id: None,
      updated_at: None,
    }
  }

  #[test]
  fn test_transit_state_wire_names() {
    assert_eq!(
      serde_json::to_string(&TransitState::EnRuta).unwrap(),
      r#""en_ruta""#
    );
    let state: TransitState = serde_json::from_str(r#""listo""#).unwrap();
    assert_eq!(state, TransitState::Listo);
  }

  #[test]
  fn test_update_parses_camel_case_payload() {
    let update: TransitUpdate =
      serde_json::from_value(json!({"transitId": "X", "newState": "listo"})).unwrap();
    assert_eq!(update.transit_id, "X");
    assert_eq!(update.new_state, Some(TransitState::Listo));
    assert!(update.transit.is_none());
  }

  #[test]
  fn test_state_delta_patches_known_entry() {
    let mut list = vec![
      transit("X", TransitState::EnRuta),
      transit("Y", TransitState::Pendiente),
    ];
    let update = TransitUpdate {
      transit_id: "X".to_string(),
      new_state: Some(TransitState::Listo),
      transit: None,
    };

    assert!(apply_transit_update(&mut list, &update));
    assert_eq!(list[0].estado, TransitState::Listo);
    assert_eq!(list[1], transit("Y", TransitState::Pendiente));
  }

  #[test]
  fn test_full_object_replaces_or_prepends() {
    let mut list = vec![transit("X", TransitState::EnRuta)];

    let mut replacement = transit("X", TransitState::Listo);
    replacement.destino = "PJC".to_string();
    let update = TransitUpdate {
      transit_id: "X".to_string(),
      new_state: None,
      transit: Some(replacement.clone()),
    };
    assert!(apply_transit_update(&mut list, &update));
    assert_eq!(list, vec![replacement]);

    let fresh = transit("Z", TransitState::Pendiente);
    let update = TransitUpdate {
      transit_id: "Z".to_string(),
      new_state: None,
      transit: Some(fresh.clone()),
    };
    assert!(apply_transit_update(&mut list, &update));
    assert_eq!(list[0], fresh);
    assert_eq!(list.len(), 2);
  }

  #[test]
  fn test_delta_for_unknown_id_is_not_applicable() {
    let mut list = vec![transit("X", TransitState::EnRuta)];
    let update = TransitUpdate {
      transit_id: "Z".to_string(),
      new_state: Some(TransitState::Listo),
      transit: None,
    };

    assert!(!apply_transit_update(&mut list, &update));
    assert_eq!(list.len(), 1);
  }

  #[test]
  fn test_merge_event_requests_refetch_when_not_applicable() {
    let held = vec![transit("X", TransitState::EnRuta)];
    let event = PushEvent {
      topic: "transits".to_string(),
      payload: json!({"transitId": "Z", "newState": "listo"}),
    };

    assert!(matches!(
      merge_transit_event(&event, Some(&held)),
      MergeOutcome::Refetch
    ));

    let event = PushEvent {
      topic: "transits".to_string(),
      payload: json!({"unrelated": true}),
    };
    assert!(matches!(
      merge_transit_event(&event, Some(&held)),
      MergeOutcome::Ignore
    ));
  }
}
