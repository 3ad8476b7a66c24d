use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

/// One request per line, one JSON response per line. `{"op":"list_rooms"}`
/// style — easy to drive by hand and trivially scriptable.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterUser {
        full_name: String,
        email: String,
        phone: String,
        birthday: NaiveDate,
        password: String,
    },
    Authenticate {
        email: String,
        password: String,
    },
    UpdateUser {
        id: Ulid,
        full_name: String,
        phone: String,
        role: Role,
    },
    DeleteUser {
        id: Ulid,
    },
    ListUsers,
    CreateRoom {
        number: String,
        room_type: RoomType,
        rate_per_night: Decimal,
        capacity: u32,
        floor: i32,
    },
    UpdateRoom {
        id: Ulid,
        number: String,
        room_type: RoomType,
        rate_per_night: Decimal,
        capacity: u32,
        floor: i32,
    },
    DeleteRoom {
        id: Ulid,
    },
    ListRooms,
    CreateBooking {
        user_id: Ulid,
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    ConfirmBooking {
        id: Ulid,
    },
    CheckIn {
        id: Ulid,
    },
    CheckOut {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
    },
    UpdateBooking {
        id: Ulid,
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    FindBooking {
        id: Ulid,
    },
    ListBookings,
    ListBookingsByUser {
        user_id: Ulid,
    },
    CheckAvailability {
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    FreeRanges {
        room_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    },
    Quit,
}

fn ok(data: Value) -> Value {
    json!({ "ok": true, "data": data })
}

fn err(e: impl std::fmt::Display) -> Value {
    json!({ "ok": false, "error": e.to_string() })
}

/// Public projection of a user. The password hash stays inside the engine.
fn user_json(u: &User) -> Value {
    json!({
        "id": u.id,
        "full_name": u.full_name,
        "email": u.email,
        "phone": u.phone,
        "birthday": u.birthday,
        "role": u.role,
    })
}

fn booking_json(b: &Booking) -> Value {
    serde_json::to_value(b).unwrap_or(Value::Null)
}

async fn dispatch(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    match req {
        Request::RegisterUser {
            full_name,
            email,
            phone,
            birthday,
            password,
        } => {
            let u = engine
                .register_user(full_name, email, phone, birthday, &password)
                .await?;
            Ok(user_json(&u))
        }
        Request::Authenticate { email, password } => match engine.authenticate(&email, &password) {
            Some(u) => Ok(user_json(&u)),
            None => Ok(Value::Null),
        },
        Request::UpdateUser {
            id,
            full_name,
            phone,
            role,
        } => {
            let u = engine.update_user(id, full_name, phone, role).await?;
            Ok(user_json(&u))
        }
        Request::DeleteUser { id } => {
            engine.delete_user(id).await?;
            Ok(Value::Null)
        }
        Request::ListUsers => Ok(Value::Array(
            engine.list_users().iter().map(user_json).collect(),
        )),
        Request::CreateRoom {
            number,
            room_type,
            rate_per_night,
            capacity,
            floor,
        } => {
            let r = engine
                .create_room(number, room_type, rate_per_night, capacity, floor)
                .await?;
            Ok(serde_json::to_value(r).unwrap_or(Value::Null))
        }
        Request::UpdateRoom {
            id,
            number,
            room_type,
            rate_per_night,
            capacity,
            floor,
        } => {
            let r = engine
                .update_room(id, number, room_type, rate_per_night, capacity, floor)
                .await?;
            Ok(serde_json::to_value(r).unwrap_or(Value::Null))
        }
        Request::DeleteRoom { id } => {
            engine.delete_room(id).await?;
            Ok(Value::Null)
        }
        Request::ListRooms => Ok(serde_json::to_value(engine.list_rooms().await).unwrap_or(Value::Null)),
        Request::CreateBooking {
            user_id,
            room_id,
            check_in,
            check_out,
        } => {
            if check_in >= check_out {
                return Err(EngineError::InvalidDateRange);
            }
            let b = engine
                .create_booking(user_id, room_id, StayRange::new(check_in, check_out))
                .await?;
            Ok(booking_json(&b))
        }
        Request::ConfirmBooking { id } => Ok(booking_json(&engine.confirm_booking(id).await?)),
        Request::CheckIn { id } => Ok(booking_json(&engine.check_in_booking(id).await?)),
        Request::CheckOut { id } => Ok(booking_json(&engine.check_out_booking(id).await?)),
        Request::CancelBooking { id } => Ok(booking_json(&engine.cancel_booking(id).await?)),
        Request::UpdateBooking {
            id,
            room_id,
            check_in,
            check_out,
        } => {
            if check_in >= check_out {
                return Err(EngineError::InvalidDateRange);
            }
            let b = engine
                .update_booking(id, room_id, StayRange::new(check_in, check_out))
                .await?;
            Ok(booking_json(&b))
        }
        Request::FindBooking { id } => Ok(engine
            .find_booking(id)
            .await
            .map(|b| booking_json(&b))
            .unwrap_or(Value::Null)),
        Request::ListBookings => Ok(Value::Array(
            engine.list_all_bookings().await.iter().map(booking_json).collect(),
        )),
        Request::ListBookingsByUser { user_id } => Ok(Value::Array(
            engine
                .list_bookings_by_user(user_id)
                .await
                .iter()
                .map(booking_json)
                .collect(),
        )),
        Request::CheckAvailability {
            room_id,
            check_in,
            check_out,
        } => {
            if check_in >= check_out {
                return Err(EngineError::InvalidDateRange);
            }
            let available = engine
                .is_room_available(room_id, &StayRange::new(check_in, check_out))
                .await;
            Ok(json!({ "available": available }))
        }
        Request::FreeRanges { room_id, from, to } => {
            if from >= to {
                return Err(EngineError::InvalidDateRange);
            }
            let ranges = engine.free_ranges(room_id, &StayRange::new(from, to)).await?;
            Ok(serde_json::to_value(ranges).unwrap_or(Value::Null))
        }
        Request::Quit => Ok(Value::Null),
    }
}

/// Read JSON requests from stdin until EOF or `quit`.
pub async fn run(engine: Arc<Engine>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(line) {
            Ok(Request::Quit) => break,
            Ok(req) => match dispatch(&engine, req).await {
                Ok(data) => ok(data),
                Err(e) => err(e),
            },
            Err(e) => err(format!("bad request: {e}")),
        };
        stdout.write_all(response.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_console");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn dispatch_end_to_end() {
        let engine = Engine::new(test_wal_path("dispatch.wal"), Arc::new(NotifyHub::new())).unwrap();

        let req: Request = serde_json::from_str(
            r#"{"op":"create_room","number":"101","room_type":"Double","rate_per_night":"100.00","capacity":2,"floor":1}"#,
        )
        .unwrap();
        let room = dispatch(&engine, req).await.unwrap();
        assert_eq!(room["number"], "101");

        let req: Request = serde_json::from_str(
            r#"{"op":"register_user","full_name":"Ada","email":"ada@example.com","phone":"+44001","birthday":"1991-07-20","password":"s3cret"}"#,
        )
        .unwrap();
        let user = dispatch(&engine, req).await.unwrap();
        assert_eq!(user["email"], "ada@example.com");
        assert!(user.get("password_hash").is_none());

        let req: Request = serde_json::from_str(
            r#"{"op":"authenticate","email":"ada@example.com","password":"s3cret"}"#,
        )
        .unwrap();
        assert!(!dispatch(&engine, req).await.unwrap().is_null());
    }

    #[tokio::test]
    async fn dispatch_rejects_inverted_dates() {
        let engine = Engine::new(test_wal_path("inverted.wal"), Arc::new(NotifyHub::new())).unwrap();
        let req = Request::CheckAvailability {
            room_id: Ulid::new(),
            check_in: NaiveDate::from_ymd_opt(2030, 6, 5).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2030, 6, 1).unwrap(),
        };
        assert!(matches!(
            dispatch(&engine, req).await.unwrap_err(),
            EngineError::InvalidDateRange
        ));
    }
}
